//! Pure computation of what to grant and what to revoke.
//!
//! Inputs and outputs keep their incoming order so the emitted GRANT lists
//! are stable between runs with the same catalog state.

/// The per-database difference between catalog truth and database state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Deltas {
    pub tables_to_grant: Vec<(String, String)>,
    pub tables_to_revoke: Vec<(String, String)>,
    pub schemas_to_grant: Vec<String>,
    pub schemas_to_revoke: Vec<String>,
    pub team_roles_to_grant: Vec<String>,
    pub team_roles_to_revoke: Vec<String>,
}

impl Deltas {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables_to_grant.is_empty()
            && self.tables_to_revoke.is_empty()
            && self.schemas_to_grant.is_empty()
            && self.schemas_to_revoke.is_empty()
            && self.team_roles_to_grant.is_empty()
            && self.team_roles_to_revoke.is_empty()
    }
}

pub fn compute(
    allowed_tables: &[(String, String)],
    held_tables: &[(String, String)],
    allowed_schemas: &[String],
    held_schemas: &[String],
    target_team_roles: &[String],
    held_team_roles: &[String],
) -> Deltas {
    Deltas {
        tables_to_grant: difference(allowed_tables, held_tables),
        tables_to_revoke: difference(held_tables, allowed_tables),
        schemas_to_grant: difference(allowed_schemas, held_schemas),
        schemas_to_revoke: difference(held_schemas, allowed_schemas),
        team_roles_to_grant: difference(target_team_roles, held_team_roles),
        team_roles_to_revoke: difference(held_team_roles, target_team_roles),
    }
}

/// Ordered `a \ b`, dropping duplicates within `a`.
fn difference<T: Eq + std::hash::Hash + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    let exclude: std::collections::HashSet<&T> = b.iter().collect();
    let mut seen = std::collections::HashSet::new();
    a.iter()
        .filter(|item| !exclude.contains(item) && seen.insert(*item))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(schema: &str, table: &str) -> (String, String) {
        (schema.to_string(), table.to_string())
    }

    #[test]
    fn test_first_issuance_grants_everything() {
        let deltas = compute(
            &[t("public", "a"), t("public", "b")],
            &[],
            &["public".into()],
            &[],
            &["_team_x".into()],
            &[],
        );
        assert_eq!(deltas.tables_to_grant, vec![t("public", "a"), t("public", "b")]);
        assert!(deltas.tables_to_revoke.is_empty());
        assert_eq!(deltas.schemas_to_grant, vec!["public".to_string()]);
        assert_eq!(deltas.team_roles_to_grant, vec!["_team_x".to_string()]);
    }

    #[test]
    fn test_converged_state_is_empty() {
        let deltas = compute(
            &[t("public", "a")],
            &[t("public", "a")],
            &["public".into()],
            &["public".into()],
            &["_team_x".into()],
            &["_team_x".into()],
        );
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_removal_revokes() {
        let deltas = compute(
            &[],
            &[t("public", "a")],
            &[],
            &["public".into()],
            &[],
            &["_team_x".into()],
        );
        assert_eq!(deltas.tables_to_revoke, vec![t("public", "a")]);
        assert_eq!(deltas.schemas_to_revoke, vec!["public".to_string()]);
        assert_eq!(deltas.team_roles_to_revoke, vec!["_team_x".to_string()]);
        assert!(deltas.tables_to_grant.is_empty());
    }

    #[test]
    fn test_order_preserved_and_duplicates_dropped() {
        let deltas = compute(
            &[t("b", "x"), t("a", "y"), t("b", "x")],
            &[],
            &[],
            &[],
            &[],
            &[],
        );
        assert_eq!(deltas.tables_to_grant, vec![t("b", "x"), t("a", "y")]);
    }
}
