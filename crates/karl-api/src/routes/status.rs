//! Fleet status: `GET /` projects the last N minutes of the keepalive log,
//! joined against the service directory, into JSON, DOT, or SVG-embedded HTML.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;

use karl_core::{
    humanize_interval, MicroDuration, MicroTimestamp, RegisteredState, RuntimeStatus, ServiceKey,
};

use crate::error::{ApiError, ApiResult};
use crate::render;
use crate::report::{
    render_time_skew, KarlStatus, MachineReport, ServiceCurrently, ServiceReport,
};
use crate::state::AppState;

/// Query-string parameters of the range query.
#[derive(Debug, Default, Deserialize)]
pub struct StatusParams {
    /// Window start, epoch microseconds.
    pub from: Option<i64>,
    /// Window end, epoch microseconds.
    pub to: Option<i64>,
    /// Window length in microseconds, counted from `from`.
    pub interval_us: Option<i64>,
    /// Window length in minutes, counted back from now.
    pub m: Option<f64>,
    /// Window length in hours, counted back from now.
    pub h: Option<f64>,
    /// Window length in days, counted back from now.
    pub d: Option<f64>,
    /// Restrict to services whose directory state is `Active`.
    pub active_only: Option<String>,
    /// Full JSON output.
    pub full: Option<String>,
    /// Minimalistic JSON output.
    pub json: Option<String>,
    /// Graphviz DOT output.
    pub dot: Option<String>,
}

/// The latest report per codename inside the window, before directory joins.
struct ProtoReport<R> {
    currently: ServiceCurrently,
    dependencies: Vec<ServiceKey>,
    runtime: Option<R>,
}

enum ResponseType {
    JsonFull,
    JsonMinimalistic,
    Dot,
    Html,
}

#[allow(clippy::cast_possible_truncation)]
fn window_duration(value: f64, unit_seconds: f64) -> MicroDuration {
    MicroDuration::from_micros((value * unit_seconds * 1e6) as i64)
}

fn select_window(params: &StatusParams, now: MicroTimestamp) -> (MicroTimestamp, MicroTimestamp) {
    let from = if let Some(us) = params.from {
        MicroTimestamp::from_micros(us)
    } else if let Some(minutes) = params.m {
        now - window_duration(minutes, 60.0)
    } else if let Some(hours) = params.h {
        now - window_duration(hours, 3_600.0)
    } else if let Some(days) = params.d {
        now - window_duration(days, 86_400.0)
    } else {
        now - MicroDuration::from_minutes(5)
    };

    let to = if let Some(us) = params.to {
        MicroTimestamp::from_micros(us)
    } else if let Some(interval_us) = params.interval_us {
        from + MicroDuration::from_micros(interval_us)
    } else {
        now
    };

    (from, to)
}

fn select_response_type(params: &StatusParams, headers: &HeaderMap) -> ResponseType {
    if params.full.is_some() {
        return ResponseType::JsonFull;
    }
    if params.json.is_some() {
        return ResponseType::JsonMinimalistic;
    }
    if params.dot.is_some() {
        return ResponseType::Dot;
    }
    let accepts_html = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| {
            accept
                .split(',')
                .any(|part| part.split(';').next().map(str::trim) == Some("text/html"))
        });
    if accepts_html {
        ResponseType::Html
    } else {
        ResponseType::JsonMinimalistic
    }
}

/// `GET /` — the fleet status page.
pub async fn fleet_status<R: RuntimeStatus>(
    State(state): State<Arc<AppState<R>>>,
    Query(params): Query<StatusParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let now = state.clock.now();
    let (from, to) = select_window(&params, now);
    let timeout = state.config.service_timeout_interval;

    // Pass one: replay the window. The latest keepalive per codename wins.
    let mut codenames_to_resolve: HashSet<String> = HashSet::new();
    let mut service_key_into_codename: HashMap<ServiceKey, String> = HashMap::new();
    let mut codenames_per_service: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut report_for_codename: HashMap<String, ProtoReport<R>> = HashMap::new();

    for persisted in state.stream.iter_window(from, to) {
        let us = persisted.idx_ts.us;
        let keepalive = persisted.entry.keepalive;
        let status = keepalive.status;

        codenames_to_resolve.insert(status.codename.clone());
        service_key_into_codename.insert(persisted.entry.location, status.codename.clone());
        codenames_per_service
            .entry(status.service.clone())
            .or_default()
            .insert(status.codename.clone());

        let age = now - us;
        let last_keepalive = format!("{} ago", humanize_interval(age));
        let currently = if age < timeout {
            ServiceCurrently::Up {
                start_time_epoch_microseconds: status.start_time_epoch_microseconds,
                last_keepalive_received: last_keepalive,
                last_keepalive_received_epoch_microseconds: us,
                uptime: humanize_interval(status.uptime_epoch_microseconds + age),
            }
        } else {
            ServiceCurrently::Down {
                start_time_epoch_microseconds: status.start_time_epoch_microseconds,
                last_keepalive_received: last_keepalive,
                last_keepalive_received_epoch_microseconds: us,
                last_reported_uptime: status.uptime.clone(),
            }
        };
        report_for_codename.insert(
            status.codename.clone(),
            ProtoReport {
                currently,
                dependencies: status.dependencies,
                runtime: keepalive.runtime,
            },
        );
    }

    let active_only = params.active_only.is_some();
    let proxied_prefix = state
        .nginx
        .as_ref()
        .map(|nginx| format!("{}{}", state.config.resolved_external_url(), nginx.route_prefix()));

    // Pass two: join against the directory inside one read-only transaction.
    let status = state
        .storage
        .read_only(move |tables| {
            let mut resolved_codenames: HashMap<String, ServiceKey> = HashMap::new();
            for codename in &codenames_to_resolve {
                let location = tables.claires.get(codename).map_or_else(
                    || ServiceKey::new(format!("zombie/{codename}"), 0),
                    |claire| claire.location.clone(),
                );
                resolved_codenames.insert(codename.clone(), location);
            }

            let mut machines: BTreeMap<String, MachineReport<R>> = BTreeMap::new();
            for (service, codenames) in &codenames_per_service {
                for codename in codenames {
                    let Some(proto) = report_for_codename.remove(codename) else {
                        continue;
                    };
                    if active_only {
                        let inactive = tables.claires.get(codename).is_some_and(|claire| {
                            claire.registered_state != RegisteredState::Active
                        });
                        if inactive {
                            continue;
                        }
                    }

                    let location = resolved_codenames[codename].clone();
                    let mut dependencies = Vec::new();
                    let mut unresolved_dependencies = Vec::new();
                    for dependency in proto.dependencies {
                        match service_key_into_codename.get(&dependency) {
                            Some(dependency_codename) => {
                                dependencies.push(dependency_codename.clone());
                            }
                            None => unresolved_dependencies.push(dependency.status_page_url()),
                        }
                    }

                    let build = tables.builds.get(codename).map(|stored| &stored.build);
                    let report = ServiceReport {
                        currently: proto.currently,
                        service: service.clone(),
                        codename: codename.clone(),
                        url_status_page_direct: location.status_page_url(),
                        url_status_page_proxied: proxied_prefix
                            .as_ref()
                            .map(|prefix| format!("{prefix}/{codename}")),
                        location: location.clone(),
                        dependencies,
                        unresolved_dependencies,
                        build_time: build.map(|b| b.build_time.clone()),
                        build_time_epoch_microseconds: build
                            .map(|b| b.build_time_epoch_microseconds),
                        git_commit: build.map(|b| b.git_commit_hash.clone()),
                        git_branch: build.map(|b| b.git_branch.clone()),
                        git_dirty: build.map(karl_core::BuildInfo::git_dirty),
                        runtime: proto.runtime,
                    };

                    machines
                        .entry(location.ip)
                        .or_insert_with(|| MachineReport {
                            services: BTreeMap::new(),
                            time_skew: None,
                        })
                        .services
                        .insert(codename.clone(), report);
                }
            }

            for (ip, machine) in &mut machines {
                if let Some(server) = tables.servers.get(ip) {
                    machine.time_skew = Some(render_time_skew(server.behind_this_by));
                }
            }

            KarlStatus {
                now,
                from,
                to,
                generation_time: MicroDuration::ZERO,
                machines,
            }
        })
        .await;

    let status = KarlStatus {
        generation_time: state.clock.now() - now,
        ..status
    };

    match select_response_type(&params, &headers) {
        ResponseType::JsonFull => Ok((
            [(header::CONTENT_TYPE, "application/json")],
            status.to_full_json(),
        )
            .into_response()),
        ResponseType::JsonMinimalistic => Ok((
            [(header::CONTENT_TYPE, "application/json")],
            status.to_minimalistic_json(),
        )
            .into_response()),
        ResponseType::Dot => {
            let dot = render::render_dot(
                &status,
                &state.config.svg_name,
                &state.config.github_repo_url,
            );
            Ok(([(header::CONTENT_TYPE, "text/plain")], dot).into_response())
        }
        ResponseType::Html => {
            let dot = render::render_dot(
                &status,
                &state.config.svg_name,
                &state.config.github_repo_url,
            );
            let svg = state
                .renderer
                .render_svg(&dot)
                .await
                .map_err(|_| ApiError::Render)?;
            Ok(Html(format!(
                "<!doctype html><head><link rel='icon' href='./favicon.png'></head><body>{svg}</body>"
            ))
            .into_response())
        }
    }
}
