//! Reservation-file materialisation and DHCP daemon plumbing.
//!
//! The reservation file is the declarative input to the local DHCP daemon:
//! one line per managed reservation, `<mac>,<ip>,<hostname>[,lease-time]`,
//! sorted by IP. It is always rewritten whole: snapshot, write `<path>.tmp`,
//! fsync, rename, then signal the daemon. The daemon's own dynamic lease
//! database is read-only input for discovery.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use fabric_core::mac::MacAddr;

use crate::{Reservation, ReservationSet};

/// File names inside the configured leases directory.
pub static RESERVATION_FILE: &str = "reservations.conf";
pub static DAEMON_LEASE_DB: &str = "dnsmasq.leases";
pub static DAEMON_PID_FILE: &str = "dnsmasq.pid";

/// Render the managed reservations in stable (ascending IP) order.
pub fn render(set: &ReservationSet, lease_time: Duration) -> String {
    let mut out = String::new();
    for r in set.managed() {
        out.push_str(&format!(
            "{},{},{},{}\n",
            r.mac,
            r.ip,
            r.hostname(),
            lease_time.as_secs()
        ));
    }
    out
}

/// Parse a reservation file back into managed reservations. Used to restore
/// state after a gateway restart; the organization is unknown until the next
/// sync overwrites the set. Malformed lines are skipped with a warning.
pub fn parse(content: &str) -> ReservationSet {
    let mut set = ReservationSet::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(',');
        let (Some(mac), Some(ip), Some(hostname)) = (fields.next(), fields.next(), fields.next())
        else {
            warn!(line, "skipping malformed reservation line");
            continue;
        };
        let (Ok(mac), Ok(ip)) = (mac.parse::<MacAddr>(), ip.parse::<Ipv4Addr>()) else {
            warn!(line, "skipping unparseable reservation line");
            continue;
        };
        set.insert(Reservation {
            vps_id: hostname.to_owned(),
            organization_id: String::new(),
            mac,
            ip,
            is_public: false,
            managed: true,
        });
    }
    set
}

/// Write `content` to `path` atomically: `<path>.tmp`, fsync, rename.
pub async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut f = fs::File::create(&tmp).await?;
    f.write_all(content.as_bytes()).await?;
    f.sync_all().await?;
    drop(f);
    fs::rename(&tmp, path).await
}

/// One entry from the daemon's dynamic lease database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonLease {
    pub expires_at: i64,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub hostname: String,
}

/// Parse dnsmasq's lease database: `<expiry> <mac> <ip> <hostname> <client-id>`.
pub fn parse_daemon_leases(content: &str) -> Vec<DaemonLease> {
    let mut leases = Vec::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(expiry), Some(mac), Some(ip)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let hostname = fields.next().unwrap_or("*");
        let (Ok(expires_at), Ok(mac), Ok(ip)) = (
            expiry.parse::<i64>(),
            mac.parse::<MacAddr>(),
            ip.parse::<Ipv4Addr>(),
        ) else {
            warn!(line, "skipping unparseable daemon lease line");
            continue;
        };
        leases.push(DaemonLease {
            expires_at,
            mac,
            ip,
            hostname: if hostname == "*" {
                String::new()
            } else {
                hostname.to_owned()
            },
        });
    }
    leases
}

/// Read the daemon lease database; a missing file is an empty database.
pub async fn read_daemon_leases(path: &Path) -> std::io::Result<Vec<DaemonLease>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(parse_daemon_leases(&content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("daemon pid file unreadable: {0}")]
    Pid(#[source] std::io::Error),
    #[error("daemon pid file holds garbage: {0:?}")]
    Parse(String),
    #[error("SIGHUP failed: {0}")]
    Kill(#[source] std::io::Error),
}

/// Ask the daemon to reload its reservation file.
pub async fn signal_daemon(pid_path: &Path) -> Result<(), SignalError> {
    let raw = fs::read_to_string(pid_path).await.map_err(SignalError::Pid)?;
    let pid: i32 = raw
        .trim()
        .parse()
        .map_err(|_| SignalError::Parse(raw.trim().to_owned()))?;
    // SAFETY: plain kill(2) with a validated pid; no memory is touched.
    let rc = unsafe { libc::kill(pid, libc::SIGHUP) };
    if rc != 0 {
        return Err(SignalError::Kill(std::io::Error::last_os_error()));
    }
    debug!(pid, "signalled DHCP daemon to reload");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed(vps: &str, mac: &str, ip: [u8; 4]) -> Reservation {
        Reservation {
            vps_id: vps.into(),
            organization_id: "org-1".into(),
            mac: mac.parse().unwrap(),
            ip: ip.into(),
            is_public: false,
            managed: true,
        }
    }

    #[test]
    fn render_is_sorted_and_managed_only() {
        let mut set = ReservationSet::new();
        set.insert(managed("vps-b", "aa:bb:cc:dd:ee:02", [10, 0, 0, 11]));
        set.insert(managed("vps-a", "aa:bb:cc:dd:ee:01", [10, 0, 0, 10]));
        set.insert(Reservation {
            managed: false,
            ..managed("", "aa:bb:cc:dd:ee:ff", [10, 0, 0, 12])
        });

        let content = render(&set, Duration::from_secs(86400));
        assert_eq!(
            content,
            "aa:bb:cc:dd:ee:01,10.0.0.10,vps-a,86400\n\
             aa:bb:cc:dd:ee:02,10.0.0.11,vps-b,86400\n"
        );
    }

    #[test]
    fn parse_restores_managed_entries() {
        let set = parse(
            "# comment\n\
             aa:bb:cc:dd:ee:01,10.0.0.10,vps-a,86400\n\
             garbage line\n\
             aa:bb:cc:dd:ee:02,10.0.0.11,vps-b\n",
        );
        assert_eq!(set.len(), 2);
        assert_eq!(set.get_ip([10, 0, 0, 10].into()).unwrap().vps_id, "vps-a");
        assert!(set.iter().all(|r| r.managed));
    }

    #[test]
    fn daemon_lease_db_parses() {
        let leases = parse_daemon_leases(
            "1719855600 aa:bb:cc:dd:ee:ff 10.0.0.12 squatter 01:aa:bb:cc:dd:ee:ff\n\
             1719855600 aa:bb:cc:dd:ee:01 10.0.0.10 * *\n\
             not-a-lease\n",
        );
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].hostname, "squatter");
        assert_eq!(leases[0].ip, Ipv4Addr::new(10, 0, 0, 12));
        assert_eq!(leases[1].hostname, "");
    }

    #[tokio::test]
    async fn write_atomic_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESERVATION_FILE);

        write_atomic(&path, "first\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\n");

        write_atomic(&path, "second\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");

        // no temp file left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(RESERVATION_FILE)]);
    }

    #[tokio::test]
    async fn read_daemon_leases_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let leases = read_daemon_leases(&dir.path().join(DAEMON_LEASE_DB))
            .await
            .unwrap();
        assert!(leases.is_empty());
    }

    #[tokio::test]
    async fn signal_without_pid_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = signal_daemon(&dir.path().join(DAEMON_PID_FILE))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::Pid(_)));
    }
}
