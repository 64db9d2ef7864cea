//! Endpoint selection: race the candidates, first responsive wins.

use std::time::Duration;

use tokio::task::JoinSet;

use crate::error::Error;
use crate::http::HttpClient;

const SELECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe the candidate URLs concurrently and return the first one that
/// answers with a success status. Candidates whose scheme does not start
/// with `http` are skipped. Outstanding probes are aborted as soon as a
/// winner is chosen.
///
/// # Errors
///
/// Returns [`Error::Discovery`] when every candidate fails or the 5-second
/// ceiling elapses.
pub async fn select_endpoints(client: &HttpClient, endpoints: &[String]) -> Result<String, Error> {
    let mut probes = JoinSet::new();
    for endpoint in endpoints {
        if !endpoint.starts_with("http") {
            continue;
        }
        let client = client.clone();
        let endpoint = endpoint.clone();
        probes.spawn(async move { client.probe(&endpoint).await.map(|()| endpoint) });
    }

    let race = async {
        while let Some(joined) = probes.join_next().await {
            if let Ok(Ok(endpoint)) = joined {
                return Some(endpoint);
            }
        }
        None
    };

    match tokio::time::timeout(SELECT_TIMEOUT, race).await {
        Ok(Some(endpoint)) => Ok(endpoint),
        _ => Err(Error::Discovery(
            "select_endpoints: no valid service endpoints".to_string(),
        )),
    }
}
