//! Keepalive ingest: `POST /` registers a report, `DELETE /` deregisters.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use rand::Rng;
use serde::Deserialize;

use karl_core::{
    ClaireBuildInfo, ClaireInfo, ClaireServiceStatus, ClaireStatus, MicroDuration,
    PersistedKeepalive, RegisteredState, RuntimeStatus, ServerInfo, ServiceKey,
    SERVER_INFO_TIME_SKEW_THRESHOLD,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Query-string parameters of the ingest endpoints.
#[derive(Debug, Deserialize)]
pub struct IngestParams {
    /// Codename claimed in the URL; must match the body when present.
    pub codename: Option<String>,
    /// Reporter port for the reverse callback; must match the body when present.
    pub port: Option<u16>,
    /// When present (with `port`), Karl fetches the status via a reverse
    /// callback instead of trusting the request body.
    pub confirm: Option<String>,
}

/// `POST /` — one keepalive.
pub async fn keepalive<R: RuntimeStatus>(
    State(state): State<Arc<AppState<R>>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<IngestParams>,
    body: String,
) -> ApiResult<&'static str> {
    let ip = peer.ip().to_string();

    // With `confirm`, the authoritative status comes from calling the reporter
    // back on the port it claims; the random suffix defeats intermediary caches.
    let json = if let (Some(_), Some(port)) = (&params.confirm, params.port) {
        let rnd: u32 = rand::rng().random_range(1_000_000_000..2_000_000_000);
        let url = format!("http://{ip}:{port}/.current?all&rnd={rnd}");
        let response = state
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|_| ApiError::Callback)?;
        response.text().await.map_err(|_| ApiError::Callback)?
    } else {
        body
    };

    let shallow: ClaireStatus =
        serde_json::from_str(&json).map_err(|_| ApiError::JsonParse)?;

    // Second parse attempt including the runtime variant; an unknown tag falls
    // back to the shallow form, with the raw JSON retained for lossless replay.
    let (status, raw_status) = match serde_json::from_str::<ClaireServiceStatus<R>>(&json) {
        Ok(full) => (full, None),
        Err(_) => (
            ClaireServiceStatus::shallow(shallow.clone()),
            serde_json::from_str::<serde_json::Value>(&json).ok(),
        ),
    };

    let codename_matches = params
        .codename
        .as_ref()
        .is_none_or(|codename| *codename == shallow.codename);
    let port_matches = params.port.is_none_or(|port| port == shallow.local_port);
    if !codename_matches || !port_matches {
        return Err(ApiError::InconsistentParameters);
    }

    let now = state.clock.now();
    let codename = shallow.codename.clone();
    let service = shallow.service.clone();
    let location = ServiceKey::new(ip.clone(), shallow.local_port);

    // Half the reported round trip approximates the one-way delay; Karl's clock
    // is the reference.
    let behind_this_by = shallow
        .last_successful_ping_epoch_microseconds
        .map(|ping| now - shallow.now - MicroDuration::from_micros(ping.as_micros() / 2));
    let build = shallow.build.clone();

    // The log entry lands before the directory commit: a directory row never
    // references a keepalive the stream does not have.
    let idx_ts = state
        .stream
        .publish(&PersistedKeepalive {
            location: location.clone(),
            keepalive: status,
            raw_status,
        })
        .map_err(|_| ApiError::Registration)?;
    {
        let mut cache = state.latest_index_cache();
        cache.insert(codename.clone(), idx_ts.index + 1);
    }

    let txn_codename = codename.clone();
    state
        .storage
        .read_write(move |fields| {
            if let Some(behind_this_by) = behind_this_by {
                let needs_update = fields.servers().get(&ip).is_none_or(|server| {
                    (server.behind_this_by - behind_this_by).abs()
                        >= SERVER_INFO_TIME_SKEW_THRESHOLD
                });
                if needs_update {
                    fields.servers().add(ServerInfo {
                        ip: ip.clone(),
                        behind_this_by,
                    });
                }
            }

            if let Some(build) = build {
                let differs = fields
                    .builds()
                    .get(&txn_codename)
                    .is_none_or(|stored| stored.build != build);
                if differs {
                    fields.builds().add(ClaireBuildInfo {
                        codename: txn_codename.clone(),
                        build,
                    });
                }
            }

            // Re-registration path: a timed-out or deregistered codename turning
            // up again goes back to `Active`.
            let needs_update = fields.claires().get(&txn_codename).is_none_or(|current| {
                current.location != location
                    || current.registered_state != RegisteredState::Active
            });
            if needs_update {
                fields.claires().add(ClaireInfo {
                    codename: txn_codename.clone(),
                    service,
                    url_status_page_direct: location.status_page_url(),
                    location,
                    reported_timestamp: now,
                    registered_state: RegisteredState::Active,
                });
            }
            Ok(())
        })
        .await
        .map_err(|_| ApiError::Registration)?;

    state.touch_keepalive(&codename, now);
    tracing::debug!(%codename, index = idx_ts.index, "keepalive recorded");
    Ok("OK\n")
}

/// `DELETE /` — deregister a codename (no-op without one).
pub async fn deregister<R: RuntimeStatus>(
    State(state): State<Arc<AppState<R>>>,
    Query(params): Query<IngestParams>,
) -> ApiResult<&'static str> {
    let Some(codename) = params.codename else {
        return Ok("NOP\n");
    };

    let txn_codename = codename.clone();
    state
        .storage
        .read_write(move |fields| {
            let mut claire = fields
                .claires()
                .get(&txn_codename)
                .cloned()
                .unwrap_or_else(|| ClaireInfo::skeleton(txn_codename.clone()));
            claire.registered_state = RegisteredState::Deregistered;
            fields.claires().add(claire);
            Ok(())
        })
        .await
        .map_err(|_| ApiError::Registration)?;

    state.forget_keepalive(&codename);
    tracing::info!(%codename, "deregistered");
    Ok("OK\n")
}
