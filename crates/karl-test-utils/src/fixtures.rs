//! Pre-built claire statuses and keepalive bodies for tests.

use karl_core::{
    BuildInfo, ClaireServiceStatus, ClaireStatus, DefaultRuntime, MicroDuration, MicroTimestamp,
    ServiceKey,
};

/// Factory for claire statuses with sensible defaults.
pub struct StatusFactory;

impl StatusFactory {
    /// A minimal shallow status for `codename` running `service` on `local_port`.
    pub fn status(codename: &str, service: &str, local_port: u16) -> ClaireStatus {
        ClaireStatus {
            codename: codename.to_string(),
            service: service.to_string(),
            local_port,
            dependencies: Vec::new(),
            build: None,
            start_time_epoch_microseconds: MicroTimestamp::ZERO,
            uptime: "0s".to_string(),
            uptime_epoch_microseconds: MicroDuration::ZERO,
            last_successful_ping_epoch_microseconds: None,
            now: MicroTimestamp::ZERO,
        }
    }

    /// Same as [`StatusFactory::status`], stamped with the reporter-side clock.
    pub fn status_at(
        codename: &str,
        service: &str,
        local_port: u16,
        now: MicroTimestamp,
    ) -> ClaireStatus {
        let mut status = Self::status(codename, service, local_port);
        status.now = now;
        status
    }

    /// Wraps a shallow status into the full (runtime-less) form.
    pub fn full(status: ClaireStatus) -> ClaireServiceStatus<DefaultRuntime> {
        ClaireServiceStatus::shallow(status)
    }

    /// A build info blob distinguishable by commit hash.
    pub fn build(commit: &str) -> BuildInfo {
        BuildInfo {
            build_time: "Feb  4 2026 12:00:00".to_string(),
            build_time_epoch_microseconds: MicroTimestamp::from_micros(1_770_000_000_000_000),
            git_commit_hash: commit.to_string(),
            git_branch: "main".to_string(),
            git_dirty_files: Vec::new(),
        }
    }

    /// A dependency key pointing at another claire's status page.
    pub fn dependency(ip: &str, port: u16) -> ServiceKey {
        ServiceKey::new(ip, port)
    }

    /// The JSON body a claire would POST for this status.
    pub fn keepalive_body(status: &ClaireStatus) -> String {
        serde_json::to_string(status).expect("statuses serialize")
    }
}
