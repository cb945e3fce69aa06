//! LNURL-pay client: turns a lightning address into a bolt11 invoice.

use std::str::FromStr;
use std::time::Duration;

use lightning_invoice::Bolt11Invoice;
use log::{debug, warn};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Metadata from the `/.well-known/lnurlp/<user>` endpoint. Sendable
/// bounds are millisats.
#[derive(Debug, Clone, Deserialize)]
pub struct PayMetadata {
    pub callback: String,
    #[serde(rename = "minSendable")]
    pub min_sendable: i64,
    #[serde(rename = "maxSendable")]
    pub max_sendable: i64,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    pr: String,
}

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
}

impl Client {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Client { http }
    }

    /// Resolves `user@domain` to its LNURL-pay metadata.
    pub async fn fetch_metadata(&self, lightning_address: &str) -> Result<PayMetadata> {
        let url = pay_endpoint(lightning_address)?;

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::LnurlMetadataFetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::LnurlMetadataFetch(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let meta: PayMetadata = response
            .json()
            .await
            .map_err(|e| Error::LnurlMetadataFetch(format!("invalid JSON: {e}")))?;

        if meta.callback.is_empty() {
            return Err(Error::LnurlMetadataFetch("missing callback URL".into()));
        }

        Ok(meta)
    }

    /// Requests a bolt11 invoice for `amount_sats` from the provider.
    pub async fn request_invoice(
        &self,
        lightning_address: &str,
        amount_sats: i64,
    ) -> Result<String> {
        let meta = self.fetch_metadata(lightning_address).await?;

        let amount_msats = amount_sats * 1000;
        check_bounds(amount_msats, &meta)?;

        // The callback may already carry query params.
        let separator = if meta.callback.contains('?') { '&' } else { '?' };
        let callback_url = format!("{}{}amount={}", meta.callback, separator, amount_msats);

        let response = self
            .http
            .get(&callback_url)
            .send()
            .await
            .map_err(|e| Error::LnurlInvoiceRequest(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::LnurlInvoiceRequest(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let invoice: InvoiceResponse = response
            .json()
            .await
            .map_err(|e| Error::LnurlInvoiceRequest(format!("invalid JSON: {e}")))?;

        if invoice.pr.is_empty() {
            return Err(Error::LnurlInvoiceRequest("empty invoice returned".into()));
        }

        match Bolt11Invoice::from_str(&invoice.pr) {
            Ok(parsed) => {
                if parsed.amount_milli_satoshis() != Some(amount_msats as u64) {
                    warn!(
                        "provider invoice amount {:?} msats differs from requested {amount_msats}",
                        parsed.amount_milli_satoshis()
                    );
                }
            }
            Err(e) => {
                return Err(Error::LnurlInvoiceRequest(format!("invalid invoice: {e}")));
            }
        }

        debug!("fetched invoice for {amount_sats} sats from {lightning_address}");
        Ok(invoice.pr)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// `user@domain` -> `https://domain/.well-known/lnurlp/user`
fn pay_endpoint(lightning_address: &str) -> Result<String> {
    let (user, domain) = lightning_address
        .split_once('@')
        .ok_or(Error::InvalidLightningAddress)?;
    if user.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(Error::InvalidLightningAddress);
    }
    Ok(format!("https://{domain}/.well-known/lnurlp/{user}"))
}

fn check_bounds(amount_msats: i64, meta: &PayMetadata) -> Result<()> {
    if amount_msats < meta.min_sendable || amount_msats > meta.max_sendable {
        return Err(Error::InvoiceAmountOutOfRange {
            sats: amount_msats / 1000,
            min_sats: meta.min_sendable / 1000,
            max_sats: meta.max_sendable / 1000,
        });
    }
    Ok(())
}
