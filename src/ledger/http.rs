//! ==============================================================================
//! http.rs - ledger gateway client
//! ==============================================================================
//!
//! purpose:
//!     implements `Ledger` against the ledger's REST gateway using reqwest.
//!     event streams are fed by polling tasks that follow a server cursor.
//!     a new stream starts at the server's latest cursor: history from
//!     before the subscription is never delivered.
//!
//! error mapping:
//!     - connect / timeout / 502 / 503 / 504  -> NetworkAbsent (failover)
//!     - 404                                  -> NotFound
//!     - any other non-success status         -> Rejected
//!
//! ==============================================================================

use super::{AssetEvent, Command, CommandResult, DeviceEvent, EventFilter, Ledger, RequirementEvent};
use crate::config::LedgerConfig;
use crate::domain::{Asset, DeviceInfo, DeviceUpdate, Location, MetricReadingRecord, RequirementSpec};
use crate::error::LedgerError;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 64;

#[derive(Deserialize)]
struct EventPage<T> {
    cursor: u64,
    events: Vec<T>,
}

/// move `cursor` past `page` and return the events to deliver
///
/// the first page only positions the cursor.
fn advance<T>(cursor: &mut Option<u64>, page: EventPage<T>, keep: impl Fn(&T) -> bool) -> Vec<T> {
    let positioned = cursor.replace(page.cursor).is_some();
    if !positioned {
        return Vec::new();
    }
    page.events.into_iter().filter(|e| keep(e)).collect()
}

#[derive(Serialize)]
struct RequirementQuery<'a> {
    asset_ids: &'a [String],
}

#[derive(Clone)]
pub struct HttpLedger {
    client: Client,
    base: String,
    poll_interval: Duration,
}

impl HttpLedger {
    pub fn new(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LedgerError::Other(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base: config.url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(config.event_poll_secs.max(1)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// spawn a cursor-following poller for `path`; events failing `keep`
    /// are skipped
    fn poll_events<T, F>(&self, path: String, query: Vec<(&'static str, String)>, keep: F) -> mpsc::Receiver<T>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(&T) -> bool + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = self.clone();
        tokio::spawn(async move {
            let mut cursor: Option<u64> = None;
            let mut ticker = tokio::time::interval(this.poll_interval);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let mut params = query.clone();
                let after = cursor.map_or_else(|| "latest".to_string(), |c| c.to_string());
                params.push(("after", after));
                let page = this.client.get(this.url(&path)).query(&params).send().await;
                let page: EventPage<T> = match read_json(page).await {
                    Ok(page) => page,
                    Err(e) => {
                        tracing::debug!(%path, error = %e, "event poll failed");
                        continue;
                    }
                };
                let events = advance(&mut cursor, page, &keep);
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            tracing::debug!(%path, "event subscription ended");
        });
        rx
    }
}

fn map_transport(e: reqwest::Error) -> LedgerError {
    if e.is_connect() || e.is_timeout() {
        LedgerError::NetworkAbsent(e.to_string())
    } else {
        LedgerError::Other(e.to_string())
    }
}

async fn check(response: Result<Response, reqwest::Error>) -> Result<Response, LedgerError> {
    let response = response.map_err(map_transport)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => LedgerError::NotFound(body),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            LedgerError::NetworkAbsent(format!("gateway returned {}", status))
        }
        _ => LedgerError::Rejected(format!("{}: {}", status, body)),
    })
}

async fn read_json<T: DeserializeOwned>(response: Result<Response, reqwest::Error>) -> Result<T, LedgerError> {
    check(response)
        .await?
        .json::<T>()
        .await
        .map_err(|e| LedgerError::Other(format!("invalid response body: {}", e)))
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn retrieve_device(&self, id: &str) -> Result<DeviceInfo, LedgerError> {
        read_json(self.client.get(self.url(&format!("/devices/{}", id))).send().await).await
    }

    async fn update_device(&self, id: &str, update: &DeviceUpdate) -> Result<(), LedgerError> {
        check(self.client.patch(self.url(&format!("/devices/{}", id))).json(update).send().await).await?;
        Ok(())
    }

    async fn unbind_device(&self, id: &str) -> Result<(), LedgerError> {
        check(self.client.delete(self.url(&format!("/devices/{}/binding", id))).send().await).await?;
        Ok(())
    }

    async fn subscribe_device_events(&self, filter: EventFilter) -> Result<mpsc::Receiver<DeviceEvent>, LedgerError> {
        let mut query = Vec::new();
        if let Some(host) = &filter.hostname {
            query.push(("hostname", host.clone()));
        }
        if let Some(id) = &filter.device_id {
            query.push(("device_id", id.clone()));
        }
        Ok(self.poll_events("/events/devices".into(), query, move |e| filter.matches_device_event(e)))
    }

    async fn subscribe_asset_events(&self, filter: EventFilter) -> Result<mpsc::Receiver<AssetEvent>, LedgerError> {
        let query = filter.device_id.map(|id| vec![("device_id", id)]).unwrap_or_default();
        Ok(self.poll_events("/events/assets".into(), query, |_| true))
    }

    async fn subscribe_requirement_events(
        &self,
        filter: EventFilter,
    ) -> Result<mpsc::Receiver<RequirementEvent>, LedgerError> {
        let query = filter.device_id.map(|id| vec![("device_id", id)]).unwrap_or_default();
        Ok(self.poll_events("/events/requirements".into(), query, |_| true))
    }

    async fn listen_commands(&self, device_id: &str) -> Result<mpsc::Receiver<Command>, LedgerError> {
        Ok(self.poll_events(format!("/devices/{}/commands", device_id), Vec::new(), |_| true))
    }

    async fn submit_command_result(&self, result: &CommandResult) -> Result<(), LedgerError> {
        let path = format!("/commands/{}/result", result.command_id);
        check(self.client.post(self.url(&path)).json(result).send().await).await?;
        Ok(())
    }

    async fn query_assets_near(&self, point: Location, radius_m: f64) -> Result<Vec<Asset>, LedgerError> {
        let query = [
            ("lat", point.latitude.to_string()),
            ("lon", point.longitude.to_string()),
            ("radius", radius_m.to_string()),
        ];
        read_json(self.client.get(self.url("/assets/near")).query(&query).send().await).await
    }

    async fn query_requirements_for_assets(&self, asset_ids: &[String]) -> Result<Vec<RequirementSpec>, LedgerError> {
        if asset_ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = RequirementQuery { asset_ids };
        read_json(self.client.post(self.url("/requirements/query")).json(&body).send().await).await
    }

    async fn post_reading(&self, record: &MetricReadingRecord) -> Result<(), LedgerError> {
        check(self.client.post(self.url("/readings")).json(record).send().await).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_gateway_is_network_absence() {
        let config = LedgerConfig {
            url: "http://127.0.0.1:9".to_string(),
            request_timeout_secs: 2,
            event_poll_secs: 1,
        };
        let ledger = HttpLedger::new(&config).unwrap();
        let err = ledger.retrieve_device("d1").await.unwrap_err();
        assert!(err.is_network_absence(), "got {err:?}");
    }

    #[test]
    fn stream_starts_at_the_latest_cursor() {
        let mut cursor = None;
        let history = EventPage { cursor: 41, events: vec![1, 2, 3] };
        assert!(advance(&mut cursor, history, |_: &u32| true).is_empty());
        assert_eq!(cursor, Some(41));

        let next = EventPage { cursor: 44, events: vec![4, 5, 6] };
        assert_eq!(advance(&mut cursor, next, |e: &u32| *e != 5), vec![4, 6]);
        assert_eq!(cursor, Some(44));
    }

    #[test]
    fn base_url_is_normalized() {
        let config = LedgerConfig { url: "http://ledger/".into(), ..Default::default() };
        let ledger = HttpLedger::new(&config).unwrap();
        assert_eq!(ledger.url("/readings"), "http://ledger/readings");
    }
}
