//! Publishes issued credentials to object storage so downstream tools
//! (notebooks, dashboards) can pick them up without talking to this service.

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::Credentials;

pub struct CredentialPublisher {
    client: Option<aws_sdk_s3::Client>,
    bucket: Option<String>,
}

impl CredentialPublisher {
    /// A publisher for the given bucket; `None` yields a no-op publisher.
    pub async fn new(bucket: Option<String>) -> Self {
        let client = match &bucket {
            Some(_) => {
                let config =
                    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                Some(aws_sdk_s3::Client::new(&config))
            }
            None => None,
        };
        Self { client, bucket }
    }

    /// A publisher that never writes anywhere.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            client: None,
            bucket: None,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Writes one credentials file under the principal's federated prefix.
    ///
    /// Best-effort with respect to issuance: a failure here surfaces as
    /// `Publish` but never invalidates the Postgres state already applied.
    pub async fn publish(&self, long_digest: &str, credentials: &Credentials) -> Result<()> {
        let (Some(client), Some(bucket)) = (&self.client, &self.bucket) else {
            debug!("credential publisher disabled; skipping");
            return Ok(());
        };

        let key = object_key(long_digest, &credentials.memorable_name);
        let body = render_body(credentials);

        client
            .put_object()
            .bucket(bucket)
            .key(&key)
            .acl(ObjectCannedAcl::BucketOwnerFullControl)
            .body(ByteStream::from(body.into_bytes()))
            .send()
            .await
            .map_err(|e| Error::Publish(e.to_string()))?;

        info!(bucket = %bucket, key = %key, "published credentials");
        Ok(())
    }
}

fn object_key(long_digest: &str, memorable_name: &str) -> String {
    format!("user/federated/{long_digest}/.credentials/db_credentials_{memorable_name}")
}

/// The fixed six-line plaintext format downstream tools parse.
fn render_body(credentials: &Credentials) -> String {
    format!(
        "dbuser {}\ndbpass {}\ndbname {}\ndbhost {}\ndbport {}\ndbmemorablename {}\n",
        credentials.db_user,
        credentials.db_password.as_deref().unwrap_or_default(),
        credentials.db_name,
        credentials.db_host,
        credentials.db_port,
        credentials.memorable_name,
    )
}
