//! Read-only projection of the catalog: which `(database, schema, table)`
//! tuples a principal (or an application template) may read, and which team
//! schemas they belong to.
//!
//! Results are ordered deterministically and deduplicated preserving first
//! occurrence, because ordering feeds straight into GRANT lists.

use crate::catalog::Store;
use crate::error::Result;
use crate::types::{AccessMode, Dataset, PrincipalRecord, SourceRef};

/// Every source table the principal is allowed to read, across all databases.
pub fn allowed_tables(store: &dyn Store, principal: &PrincipalRecord) -> Result<Vec<SourceRef>> {
    let mut refs = Vec::new();

    for dataset in store.list_live_datasets()? {
        if !dataset_visible(&dataset, principal.privileged) {
            continue;
        }
        if !principal_can_read(store, principal, &dataset)? {
            continue;
        }
        collect_dataset_refs(store, &dataset, &mut refs)?;
    }

    Ok(dedup_preserving_order(refs))
}

/// Same access logic keyed on application-template grants rather than user
/// grants. Applications never see unpublished datasets and have no email
/// domain to match.
pub fn application_allowed_tables(store: &dyn Store, template: &str) -> Result<Vec<SourceRef>> {
    let mut refs = Vec::new();

    for dataset in store.list_live_datasets()? {
        if !dataset_visible(&dataset, false) {
            continue;
        }
        let readable = match dataset.access {
            AccessMode::Open | AccessMode::RequiresAuthentication => true,
            AccessMode::RequiresAuthorization => {
                store.has_application_permission(template, &dataset.id)?
            }
        };
        if !readable {
            continue;
        }
        collect_dataset_refs(store, &dataset, &mut refs)?;
    }

    Ok(dedup_preserving_order(refs))
}

/// The `_team_<slug>` schemas for every team the principal belongs to.
pub fn team_schemas(store: &dyn Store, principal_id: &str) -> Result<Vec<String>> {
    Ok(store
        .principal_teams(principal_id)?
        .iter()
        .map(|t| t.schema_name())
        .collect())
}

fn dataset_visible(dataset: &Dataset, privileged: bool) -> bool {
    if dataset.deleted || !dataset.dataset_type.grants_tables() {
        return false;
    }
    dataset.published || privileged
}

fn principal_can_read(
    store: &dyn Store,
    principal: &PrincipalRecord,
    dataset: &Dataset,
) -> Result<bool> {
    match dataset.access {
        AccessMode::Open | AccessMode::RequiresAuthentication => Ok(true),
        AccessMode::RequiresAuthorization => {
            if store.has_principal_permission(&principal.id, &dataset.id)? {
                return Ok(true);
            }
            let domain = principal.email_domain();
            Ok(!domain.is_empty()
                && dataset
                    .authorized_email_domains
                    .iter()
                    .any(|d| d.eq_ignore_ascii_case(&domain)))
        }
    }
}

fn collect_dataset_refs(
    store: &dyn Store,
    dataset: &Dataset,
    refs: &mut Vec<SourceRef>,
) -> Result<()> {
    // Reference datasets expose their mirror table; everything else exposes
    // its source tables.
    if let (Some(db), Some(table)) = (&dataset.external_database, &dataset.reference_table_name) {
        refs.push(SourceRef::new(db.clone(), "public", table.clone()));
        return Ok(());
    }

    for table in store.list_dataset_tables(&dataset.id)? {
        refs.push(SourceRef::new(table.database, table.schema, table.table));
    }
    Ok(())
}

fn dedup_preserving_order(refs: Vec<SourceRef>) -> Vec<SourceRef> {
    let mut seen = std::collections::HashSet::new();
    refs.into_iter().filter(|r| seen.insert(r.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteStore;
    use crate::types::{DatasetType, SourceTable, Team};
    use chrono::Utc;

    fn fixture() -> (SqliteStore, PrincipalRecord) {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();

        let principal = PrincipalRecord {
            id: "p1".into(),
            external_id: "sso-p1".into(),
            email: "jane@trade.gov.uk".into(),
            privileged: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.create_principal(&principal).unwrap();
        (store, principal)
    }

    fn dataset(id: &str, access: AccessMode, published: bool) -> Dataset {
        Dataset {
            id: id.into(),
            name: id.into(),
            dataset_type: DatasetType::Master,
            published,
            deleted: false,
            access,
            authorized_email_domains: Vec::new(),
            external_database: None,
            reference_table_name: None,
            created_at: Utc::now(),
        }
    }

    fn table(store: &SqliteStore, id: &str, dataset: &str, db: &str, schema: &str, tbl: &str) {
        store
            .create_source_table(&SourceTable {
                id: id.into(),
                dataset_id: dataset.into(),
                database: db.into(),
                schema: schema.into(),
                table: tbl.into(),
            })
            .unwrap();
    }

    #[test]
    fn test_requires_authentication_is_readable() {
        let (store, principal) = fixture();
        store
            .create_dataset(&dataset("d1", AccessMode::RequiresAuthentication, true))
            .unwrap();
        table(&store, "t1", "d1", "main", "public", "trade_stats");

        let refs = allowed_tables(&store, &principal).unwrap();
        assert_eq!(refs, vec![SourceRef::new("main", "public", "trade_stats")]);
    }

    #[test]
    fn test_requires_authorization_needs_grant() {
        let (store, principal) = fixture();
        store
            .create_dataset(&dataset("d1", AccessMode::RequiresAuthorization, true))
            .unwrap();
        table(&store, "t1", "d1", "main", "public", "secret");

        assert!(allowed_tables(&store, &principal).unwrap().is_empty());

        store.grant_dataset_to_principal("p1", "d1").unwrap();
        assert_eq!(allowed_tables(&store, &principal).unwrap().len(), 1);
    }

    #[test]
    fn test_authorized_email_domain() {
        let (store, principal) = fixture();
        let mut d = dataset("d1", AccessMode::RequiresAuthorization, true);
        d.authorized_email_domains = vec!["Trade.gov.uk".into()];
        store.create_dataset(&d).unwrap();
        table(&store, "t1", "d1", "main", "public", "stats");

        assert_eq!(allowed_tables(&store, &principal).unwrap().len(), 1);
    }

    #[test]
    fn test_unpublished_needs_privilege() {
        let (store, mut principal) = fixture();
        store
            .create_dataset(&dataset("d1", AccessMode::RequiresAuthentication, false))
            .unwrap();
        table(&store, "t1", "d1", "main", "public", "draft");

        assert!(allowed_tables(&store, &principal).unwrap().is_empty());

        principal.privileged = true;
        assert_eq!(allowed_tables(&store, &principal).unwrap().len(), 1);
    }

    #[test]
    fn test_deleted_and_visualisation_excluded() {
        let (store, principal) = fixture();
        let mut deleted = dataset("d1", AccessMode::Open, true);
        deleted.deleted = true;
        store.create_dataset(&deleted).unwrap();
        table(&store, "t1", "d1", "main", "public", "gone");

        let mut viz = dataset("d2", AccessMode::Open, true);
        viz.dataset_type = DatasetType::Visualisation;
        store.create_dataset(&viz).unwrap();
        table(&store, "t2", "d2", "main", "public", "dashboard");

        assert!(allowed_tables(&store, &principal).unwrap().is_empty());
    }

    #[test]
    fn test_reference_dataset_maps_to_external_database() {
        let (store, principal) = fixture();
        let mut d = dataset("d1", AccessMode::RequiresAuthentication, true);
        d.dataset_type = DatasetType::Reference;
        d.external_database = Some("reference".into());
        d.reference_table_name = Some("ref_countries".into());
        store.create_dataset(&d).unwrap();

        let refs = allowed_tables(&store, &principal).unwrap();
        assert_eq!(
            refs,
            vec![SourceRef::new("reference", "public", "ref_countries")]
        );
    }

    #[test]
    fn test_duplicates_removed_preserving_first_occurrence() {
        let (store, principal) = fixture();
        store.create_dataset(&dataset("d1", AccessMode::Open, true)).unwrap();
        store.create_dataset(&dataset("d2", AccessMode::Open, true)).unwrap();
        table(&store, "t1", "d1", "main", "public", "shared");
        table(&store, "t2", "d1", "main", "public", "only_d1");
        table(&store, "t3", "d2", "main", "public", "shared");

        let refs = allowed_tables(&store, &principal).unwrap();
        assert_eq!(
            refs,
            vec![
                SourceRef::new("main", "public", "shared"),
                SourceRef::new("main", "public", "only_d1"),
            ]
        );
    }

    #[test]
    fn test_application_allowed_tables() {
        let (store, _) = fixture();
        store
            .create_dataset(&dataset("d1", AccessMode::RequiresAuthorization, true))
            .unwrap();
        table(&store, "t1", "d1", "main", "public", "app_data");

        assert!(application_allowed_tables(&store, "superset").unwrap().is_empty());
        store.grant_dataset_to_application("superset", "d1").unwrap();
        assert_eq!(application_allowed_tables(&store, "superset").unwrap().len(), 1);
    }

    #[test]
    fn test_team_schemas() {
        let (store, principal) = fixture();
        store
            .create_team(&Team {
                id: "team1".into(),
                name: "Data Engineering".into(),
                slug: "data_eng".into(),
                created_at: Utc::now(),
            })
            .unwrap();
        store.add_team_member("team1", &principal.id).unwrap();

        assert_eq!(
            team_schemas(&store, &principal.id).unwrap(),
            vec!["_team_data_eng".to_string()]
        );
    }
}
