use super::store::{SessionStore, StoreError};
use super::Session;
use crate::config::Settings;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use tracing::{error, info};

/// Session store on Cloudflare R2 / AWS S3
///
/// Objects are read and written directly, without a local cache, so every
/// gateway instance sees the latest saved version.
pub struct R2SessionStore {
    client: Client,
    bucket: String,
}

impl R2SessionStore {
    /// Create a new R2 session store
    ///
    /// # Errors
    ///
    /// Returns an error if R2 configuration is missing.
    pub async fn new(settings: &Settings) -> Result<Self, StoreError> {
        let endpoint_url = settings
            .r2_endpoint_url
            .as_ref()
            .ok_or_else(|| StoreError::Config("R2_ENDPOINT_URL is missing".into()))?;
        let access_key = settings
            .r2_access_key_id
            .as_ref()
            .ok_or_else(|| StoreError::Config("R2_ACCESS_KEY_ID is missing".into()))?;
        let secret_key = settings
            .r2_secret_access_key
            .as_ref()
            .ok_or_else(|| StoreError::Config("R2_SECRET_ACCESS_KEY is missing".into()))?;
        let bucket = settings
            .r2_bucket_name
            .as_ref()
            .ok_or_else(|| StoreError::Config("R2_BUCKET_NAME is missing".into()))?;

        let credentials = Credentials::new(access_key, secret_key, None, None, "r2-sessions");

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("auto"))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.clone(),
        })
    }
}

#[async_trait]
impl SessionStore for R2SessionStore {
    async fn load(&self, user_id: i64) -> Result<Option<Session>, StoreError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(session_key(user_id))
            .send()
            .await;

        match result {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?
                    .into_bytes();
                Ok(Some(serde_json::from_slice(&data)?))
            }
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => Ok(None),
            Err(e) => Err(StoreError::S3Get(Box::new(e))),
        }
    }

    async fn store(&self, session: &Session) -> Result<(), StoreError> {
        let body = serde_json::to_vec(session)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(session_key(session.user_id))
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(SESSION_PREFIX)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            total += u64::try_from(page.contents().len()).unwrap_or(u64::MAX);
            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => return Ok(total),
            }
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "R2 session store reachable");
                Ok(())
            }
            Err(e) => {
                let err_msg = format!("R2 connectivity test failed: {e:#?}");
                error!("{}", err_msg);
                Err(StoreError::Backend(err_msg))
            }
        }
    }

    fn backend(&self) -> &'static str {
        "r2"
    }
}

const SESSION_PREFIX: &str = "sessions/";

/// Returns the R2 key for a user's session file
#[must_use]
pub fn session_key(user_id: i64) -> String {
    format!("{SESSION_PREFIX}{user_id}.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_layout() {
        assert_eq!(session_key(12345), "sessions/12345.json");
        assert_eq!(session_key(-100), "sessions/-100.json");
    }

    #[tokio::test]
    async fn test_missing_credentials_are_reported() {
        let settings = Settings {
            r2_bucket_name: Some("bucket".to_string()),
            ..Settings::default()
        };
        let err = R2SessionStore::new(&settings).await.err();
        assert!(matches!(err, Some(StoreError::Config(msg)) if msg.contains("R2_ENDPOINT_URL")));
    }
}
