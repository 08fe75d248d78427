//! ACME wire client (C2): one function per RFC 8555 protocol step, driving
//! a `reqwest::Client` against JSON wire types with a JWS envelope
//! assembled by hand rather than through a heavier ACME crate.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::{AcmeError, Result};
use super::key::AccountKey;

const USER_AGENT: &str = concat!("fortify-acme/", env!("CARGO_PKG_VERSION"));

/// Polling budget for order/authorization status: bounded at 10 iterations
/// so a stalled validation can't hang a resolution indefinitely.
const POLL_MAX_ITERATIONS: u32 = 10;
/// Growth applied to the wait between polling iterations absent a
/// server-supplied `Retry-After`. The first iteration waits zero.
const POLL_INTERVAL_STEP: Duration = Duration::from_secs(3);

/// The `Retry-After` header, if present, as a `Duration` — seconds-only
/// form, which is what ACME servers send (RFC 8555 doesn't use the
/// HTTP-date form).
fn retry_after_duration(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Directory {
    #[serde(rename = "newNonce")]
    pub new_nonce: String,
    #[serde(rename = "newAccount")]
    pub new_account: String,
    #[serde(rename = "newOrder")]
    pub new_order: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Serialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub id_type: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            id_type: "dns".into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub status: OrderStatus,
    pub authorizations: Vec<String>,
    pub finalize: String,
    pub certificate: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentifierValue {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Authorization {
    pub status: String,
    pub identifier: IdentifierValue,
    pub challenges: Vec<Challenge>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub challenge_type: String,
    pub url: String,
    pub token: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct Problem {
    #[serde(rename = "type")]
    problem_type: Option<String>,
    detail: Option<String>,
}

/// An order freshly created via `new_order`, with its own URL (needed for
/// later polling) alongside the decoded body.
pub struct CreatedOrder {
    pub url: String,
    pub order: Order,
}

pub struct AcmeClient {
    http: reqwest::Client,
    directory_url: String,
}

impl AcmeClient {
    pub fn new(directory_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            directory_url: directory_url.into(),
        })
    }

    /// Step 1: fetch the ACME directory.
    pub async fn directory(&self) -> Result<Directory> {
        let resp = self.http.get(&self.directory_url).send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }

    /// Step 2: obtain a fresh anti-replay nonce.
    pub async fn new_nonce(&self, directory: &Directory) -> Result<String> {
        let resp = self.http.head(&directory.new_nonce).send().await?;
        resp.headers()
            .get("replay-nonce")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Protocol {
                problem_type: "urn:ietf:params:acme:error:badNonce".into(),
                detail: "server did not return a Replay-Nonce header".into(),
            })
    }

    /// Step 3: register (or retrieve, if already registered under this key)
    /// the account, returning its server-assigned key identifier (KID).
    pub async fn new_account(
        &self,
        directory: &Directory,
        key: &AccountKey,
        email: &str,
    ) -> Result<String> {
        let payload = json!({
            "termsOfServiceAgreed": true,
            "contact": [format!("mailto:{email}")],
        });
        let resp = self
            .signed_request(directory, &directory.new_account, key, None, Some(payload))
            .await?;
        resp.headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Protocol {
                problem_type: "urn:ietf:params:acme:error:accountDoesNotExist".into(),
                detail: "account response carried no Location header".into(),
            })
    }

    /// Step 4: create an order for a single domain.
    pub async fn new_order(
        &self,
        directory: &Directory,
        key: &AccountKey,
        kid: &str,
        domain: &str,
    ) -> Result<CreatedOrder> {
        let payload = json!({ "identifiers": [Identifier::dns(domain)] });
        let resp = self
            .signed_request(directory, &directory.new_order, key, Some(kid), Some(payload))
            .await?;
        let url = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Protocol {
                problem_type: "urn:ietf:params:acme:error:malformed".into(),
                detail: "order response carried no Location header".into(),
            })?;
        let order: Order = resp.json().await?;
        Ok(CreatedOrder { url, order })
    }

    /// Step 5: fetch an authorization object via POST-as-GET.
    pub async fn fetch_authorization(
        &self,
        directory: &Directory,
        key: &AccountKey,
        kid: &str,
        auth_url: &str,
    ) -> Result<Authorization> {
        let resp = self
            .signed_request(directory, auth_url, key, Some(kid), None)
            .await?;
        Ok(resp.json().await?)
    }

    /// Step 6: tell the server the HTTP-01 challenge is ready to be fetched.
    pub async fn respond_to_challenge(
        &self,
        directory: &Directory,
        key: &AccountKey,
        kid: &str,
        challenge_url: &str,
    ) -> Result<()> {
        self.signed_request(directory, challenge_url, key, Some(kid), Some(json!({})))
            .await?;
        Ok(())
    }

    /// Step 7: poll an authorization URL until it reaches `valid`/`invalid`
    /// or the iteration budget is exhausted. The wait between iterations
    /// starts near zero and grows by [`POLL_INTERVAL_STEP`] each time,
    /// unless the server's `Retry-After` header says otherwise.
    pub async fn poll_authorization(
        &self,
        directory: &Directory,
        key: &AccountKey,
        kid: &str,
        auth_url: &str,
    ) -> Result<Authorization> {
        let mut last_status = String::new();
        let mut wait = Duration::ZERO;
        for _ in 0..POLL_MAX_ITERATIONS {
            let resp = self
                .signed_request(directory, auth_url, key, Some(kid), None)
                .await?;
            let retry_after = retry_after_duration(&resp);
            let auth: Authorization = resp.json().await?;
            last_status = auth.status.clone();
            match auth.status.as_str() {
                "valid" => return Ok(auth),
                "invalid" => {
                    return Err(AcmeError::Protocol {
                        problem_type: "urn:ietf:params:acme:error:rejectedIdentifier".into(),
                        detail: "authorization became invalid".into(),
                    })
                }
                _ => {
                    tokio::time::sleep(retry_after.unwrap_or(wait)).await;
                    wait += POLL_INTERVAL_STEP;
                }
            }
        }
        Err(AcmeError::State(last_status))
    }

    /// Step 8: poll an order URL until it reaches `expected` or
    /// `invalid`, or the iteration budget is exhausted. Same backoff shape
    /// as [`Self::poll_authorization`].
    pub async fn poll_order(
        &self,
        directory: &Directory,
        key: &AccountKey,
        kid: &str,
        order_url: &str,
        expected: OrderStatus,
    ) -> Result<Order> {
        let mut last_status = OrderStatus::Pending;
        let mut wait = Duration::ZERO;
        for _ in 0..POLL_MAX_ITERATIONS {
            let resp = self
                .signed_request(directory, order_url, key, Some(kid), None)
                .await?;
            let retry_after = retry_after_duration(&resp);
            let order: Order = resp.json().await?;
            last_status = order.status;
            if order.status == expected {
                return Ok(order);
            }
            if order.status == OrderStatus::Invalid {
                return Err(AcmeError::Protocol {
                    problem_type: "urn:ietf:params:acme:error:malformed".into(),
                    detail: "order became invalid".into(),
                });
            }
            tokio::time::sleep(retry_after.unwrap_or(wait)).await;
            wait += POLL_INTERVAL_STEP;
        }
        Err(AcmeError::State(format!("{last_status:?}")))
    }

    /// Step 9: submit the CSR to finalize a ready order.
    pub async fn finalize(
        &self,
        directory: &Directory,
        key: &AccountKey,
        kid: &str,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<()> {
        let payload = json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) });
        self.signed_request(directory, finalize_url, key, Some(kid), Some(payload))
            .await?;
        Ok(())
    }

    /// Step 10: download the issued certificate chain as PEM text.
    pub async fn download_certificate(
        &self,
        directory: &Directory,
        key: &AccountKey,
        kid: &str,
        certificate_url: &str,
    ) -> Result<String> {
        let resp = self
            .signed_request(directory, certificate_url, key, Some(kid), None)
            .await?;
        Ok(resp.text().await?)
    }

    /// Build, sign, and POST a JWS envelope. `key_id` is `None` only for
    /// `newAccount`, where the request authenticates with the account's own
    /// JWK rather than a server-assigned KID.
    async fn signed_request(
        &self,
        directory: &Directory,
        url: &str,
        key: &AccountKey,
        key_id: Option<&str>,
        payload: Option<Value>,
    ) -> Result<reqwest::Response> {
        let nonce = self.new_nonce(directory).await?;

        let mut protected = json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url,
        });
        match key_id {
            Some(kid) => protected["kid"] = Value::String(kid.to_string()),
            None => protected["jwk"] = serde_json::to_value(key.public_jwk()?)?,
        }

        let protected_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&protected)?);
        let payload_b64 = match payload {
            Some(v) => URL_SAFE_NO_PAD.encode(serde_json::to_vec(&v)?),
            None => String::new(),
        };

        let signing_input = format!("{protected_b64}.{payload_b64}");
        let signature = key.sign(signing_input.as_bytes())?;

        let body = json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature),
        });

        let resp = self
            .http
            .post(url)
            .header("content-type", "application/jose+json")
            .json(&body)
            .send()
            .await?;
        check_status(resp).await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let problem: Option<Problem> = serde_json::from_str(&body).ok();
    match problem {
        Some(p) => Err(AcmeError::Protocol {
            problem_type: p.problem_type.unwrap_or_else(|| "about:blank".into()),
            detail: p.detail.unwrap_or(body),
        }),
        None => Err(AcmeError::Protocol {
            problem_type: "about:blank".into(),
            detail: format!("HTTP {status}: {body}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::key::AccountKey;

    #[test]
    fn identifier_serializes_with_dns_type() {
        let id = Identifier::dns("example.com");
        let v = serde_json::to_value(&id).unwrap();
        assert_eq!(v["type"], "dns");
        assert_eq!(v["value"], "example.com");
    }

    #[test]
    fn order_status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(OrderStatus::Ready).unwrap(), "ready");
        assert_eq!(
            serde_json::to_value(OrderStatus::Processing).unwrap(),
            "processing"
        );
    }

    #[test]
    fn order_deserializes_from_wire_json() {
        let raw = r#"{
            "status": "pending",
            "authorizations": ["https://acme.test/authz/1"],
            "finalize": "https://acme.test/finalize/1",
            "certificate": null
        }"#;
        let order: Order = serde_json::from_str(raw).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.authorizations.len(), 1);
        assert!(order.certificate.is_none());
    }

    #[tokio::test]
    async fn signed_request_without_kid_embeds_jwk() {
        // Exercises the jwk-vs-kid branch without a network call: build the
        // protected header the same way signed_request does and check shape.
        let key = AccountKey::generate().unwrap();
        let mut protected = json!({ "alg": "ES256", "nonce": "abc", "url": "https://x/y" });
        protected["jwk"] = serde_json::to_value(key.public_jwk().unwrap()).unwrap();
        assert!(protected.get("jwk").is_some());
        assert!(protected.get("kid").is_none());
    }
}
