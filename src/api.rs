//! Client for the orchestration server's work-manifest API.
//!
//! Transport failures are retried with backoff; HTTP status handling stays
//! with the caller because the meaning of a status differs per endpoint
//! (a 404 on initiate is "no manifest", a non-200 on results submission is
//! fatal).

use std::time::Duration;

use base64::Engine as _;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::retry;
use crate::work_manifest::WorkManifest;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(300);
const RETRY_POLICY: retry::Policy = retry::Policy::new(3, Duration::from_secs(1), 1.5);

/// Send a request, retrying transport failures with backoff. Any response
/// the server produced is returned as-is; statuses are the caller's to
/// interpret.
pub async fn send_with_retry<F>(build: F) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let res = retry::run(
        RETRY_POLICY,
        || async { build().send().await },
        |r| match r {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("REQUESTS : FAILED : {e}");
                false
            }
        },
    )
    .await;

    Ok(res?)
}

pub struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    pub fn new(base_url: &str) -> Result<Client> {
        let http = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()?;

        Ok(Client {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn manifest_url(&self, work_token: &str) -> String {
        format!("{}/v1/work-manifests/{}", self.base_url, work_token)
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        send_with_retry(build).await
    }

    /// Fetch the work manifest for a token. A 404 is the distinct "no work
    /// manifest" condition, which usually means a manually triggered run.
    pub async fn initiate_work_manifest(
        &self,
        work_token: &str,
        run_id: &str,
        sha: &str,
    ) -> Result<WorkManifest> {
        let url = format!("{}/initiate", self.manifest_url(work_token));
        let body = serde_json::json!({ "run_id": run_id, "sha": sha });

        let res = self
            .send_with_retry(|| self.http.post(&url).json(&body))
            .await?;

        match res.status() {
            reqwest::StatusCode::NOT_FOUND => {
                tracing::error!("{}", res.text().await.unwrap_or_default());
                Err(Error::NoWorkManifest)
            }
            reqwest::StatusCode::OK => Ok(res.json().await?),
            status => {
                tracing::error!("{}", res.text().await.unwrap_or_default());
                Err(Error::HttpStatus(format!(
                    "invalid work manifest response code: {status}"
                )))
            }
        }
    }

    /// PUT a payload against the work manifest (results, index output,
    /// built config or tree). Status interpretation is the caller's.
    pub async fn put_work_manifest(
        &self,
        work_token: &str,
        body: &Value,
    ) -> Result<reqwest::Response> {
        let url = self.manifest_url(work_token);
        self.send_with_retry(|| self.http.put(&url).json(body)).await
    }

    /// Store a plan artifact envelope. Returns whether the server accepted
    /// it plus the response body for diagnostics.
    pub async fn store_plan(
        &self,
        work_token: &str,
        path: &str,
        workspace: &str,
        plan_data: &Value,
        has_changes: bool,
    ) -> Result<(bool, String)> {
        let url = format!("{}/plans", self.manifest_url(work_token));
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(plan_data)?);
        let body = serde_json::json!({
            "path": path,
            "workspace": workspace,
            "plan_data": encoded,
            "has_changes": has_changes,
        });

        let res = self
            .send_with_retry(|| self.http.post(&url).json(&body))
            .await?;

        let ok = res.status() == reqwest::StatusCode::OK;
        let text = res.text().await.unwrap_or_default();
        Ok((ok, text))
    }

    /// Retrieve the stored plan data for a dirspace, already
    /// base64-decoded. `None` when the server has nothing for it.
    pub async fn fetch_plan(
        &self,
        work_token: &str,
        path: &str,
        workspace: &str,
    ) -> Result<Option<Vec<u8>>> {
        let url = format!("{}/plans", self.manifest_url(work_token));

        let res = self
            .send_with_retry(|| {
                self.http
                    .get(&url)
                    .query(&[("path", path), ("workspace", workspace)])
            })
            .await?;

        if res.status() != reqwest::StatusCode::OK {
            return Ok(None);
        }

        let body: Value = res.json().await?;
        let data = body
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::HttpStatus("plan response missing data".to_string()))?;

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| Error::HttpStatus(format!("invalid plan data encoding: {e}")))?;

        Ok(Some(decoded))
    }

    /// Refresh the short-lived VCS access token for this work manifest.
    /// Returns the raw status and body; the step handler interprets them.
    pub async fn access_token(
        &self,
        work_token: &str,
        api_token: &str,
    ) -> Result<(reqwest::StatusCode, String)> {
        let url = format!("{}/access-token", self.manifest_url(work_token));
        let auth = format!("bearer {api_token}");

        let res = self
            .send_with_retry(|| self.http.post(&url).header("authorization", &auth))
            .await?;

        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        Ok((status, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slash() {
        let client = Client::new("https://app.terrateam.io/").unwrap();
        assert_eq!(client.base_url(), "https://app.terrateam.io");
        assert_eq!(
            client.manifest_url("tok"),
            "https://app.terrateam.io/v1/work-manifests/tok"
        );
    }
}
