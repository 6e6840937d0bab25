use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::info;

use crate::Result;
use crate::state::{Forward, ResourceKey};

/// Sentinel bracketing the region this program owns. Everything outside the
/// region is preserved byte for byte.
pub const MANAGED_MARKER: &str = "# KUBETRANSPORT MANAGED";

#[derive(Debug)]
pub struct HostsFile {
    raw: Vec<u8>,
    unmanaged: Vec<String>,
    newline: &'static str,
}

impl HostsFile {
    pub fn unmanaged(&self) -> &[String] {
        &self.unmanaged
    }
}

/// Reads and parses the hosts file. A missing file parses as empty; it will
/// be created on the first write.
pub fn load(path: &Path) -> Result<HostsFile> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(parse(raw))
}

/// Splits a hosts file into the lines we must preserve. Lines between the
/// sentinels are dropped, the sentinels themselves are dropped, and so is
/// the single blank line preceding an opening sentinel (our own spacer from
/// the last write, re-added on merge).
fn parse(raw: Vec<u8>) -> HostsFile {
    let newline = if raw.contains(&b'\r') { "\r\n" } else { "\n" };
    let text = String::from_utf8_lossy(&raw).into_owned();

    let mut unmanaged = Vec::new();
    let mut ignoring = false;
    for line in text.lines() {
        if line == MANAGED_MARKER {
            if !ignoring && unmanaged.last().is_some_and(|l: &String| l.is_empty()) {
                unmanaged.pop();
            }
            ignoring = !ignoring;
        } else if !ignoring {
            unmanaged.push(line.to_string());
        }
    }

    HostsFile {
        raw,
        unmanaged,
        newline,
    }
}

fn merge(unmanaged: &[String], managed: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(unmanaged.len() + managed.len() + 4);
    out.extend_from_slice(unmanaged);
    out.push(String::new());
    out.push(MANAGED_MARKER.to_string());
    out.extend_from_slice(managed);
    out.push(MANAGED_MARKER.to_string());
    out.push(String::new());
    out
}

/// The cluster DNS names a service resolves under, in the order they appear
/// on its hosts line.
fn names_for_service(key: &ResourceKey) -> [String; 3] {
    [
        format!("{}.{}", key.name, key.namespace),
        format!("{}.{}.svc", key.name, key.namespace),
        format!("{}.{}.svc.cluster.local", key.name, key.namespace),
    ]
}

/// Managed lines for the given forwards (expected pre-sorted). Only
/// forwards that have both a chosen pod and an allocated address resolve.
fn managed_lines(forwards: &[Forward]) -> Vec<String> {
    forwards
        .iter()
        .filter_map(|fwd| {
            let ip = fwd.local_ip?;
            fwd.pod.as_ref()?;
            Some(format!(
                "{} {}",
                ip,
                names_for_service(&fwd.service.key).join(" ")
            ))
        })
        .collect()
}

/// Rewrites the hosts file for the given forwards. Touches the file only
/// when the merged bytes differ from what is on disk.
pub fn sync(path: &Path, forwards: &[Forward]) -> Result<()> {
    let hosts = load(path)?;
    let merged = merge(&hosts.unmanaged, &managed_lines(forwards));
    let bytes = merged.join(hosts.newline).into_bytes();

    if bytes != hosts.raw {
        write_hosts(path, &bytes)?;
        info!(path = %path.display(), entries = forwards.len(), "hosts file updated");
    }
    Ok(())
}

fn write_hosts(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(path)?;
    f.write_all(bytes)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use proptest::prelude::*;

    use super::*;
    use crate::state::{Selector, Service, Status};

    fn forward(ns: &str, name: &str, pod_name: &str, last_octet: u8) -> Forward {
        Forward {
            service: Service {
                key: ResourceKey::new(ns, name),
                selector: Selector::from([("app".to_string(), name.to_string())]),
                ports: vec![],
            },
            pod: Some(crate::state::Pod {
                key: ResourceKey::new(ns, pod_name),
                labels: Selector::new(),
                ports: vec![],
            }),
            local_ip: Some(Ipv4Addr::new(127, 0, 16, last_octet)),
            status: Status::Setup,
            last_error: None,
        }
    }

    fn render(raw: &str, forwards: &[Forward]) -> String {
        let hosts = parse(raw.as_bytes().to_vec());
        merge(&hosts.unmanaged, &managed_lines(forwards)).join(hosts.newline)
    }

    const USER_CONTENT: &str = "# Some comment\n127.0.0.1       localhost\n::1             localhost\n";

    #[test]
    fn test_managed_lines() {
        let forwards = vec![
            forward("default", "foo", "foo123", 1),
            forward("default", "bar", "bar123", 2),
            forward("bang", "baz", "baz-0", 3),
        ];
        assert_eq!(
            managed_lines(&forwards),
            vec![
                "127.0.16.1 foo.default foo.default.svc foo.default.svc.cluster.local",
                "127.0.16.2 bar.default bar.default.svc bar.default.svc.cluster.local",
                "127.0.16.3 baz.bang baz.bang.svc baz.bang.svc.cluster.local",
            ]
        );
    }

    #[test]
    fn test_unbacked_forwards_resolve_nothing() {
        let mut waiting = forward("default", "foo", "foo123", 1);
        waiting.pod = None;
        waiting.status = Status::WaitPod;
        let mut unallocated = forward("default", "bar", "bar123", 2);
        unallocated.local_ip = None;
        assert!(managed_lines(&[waiting, unallocated]).is_empty());
    }

    #[test]
    fn test_user_lines_preserved_in_order() {
        let forwards = vec![forward("default", "foo", "foo123", 1)];
        let out = render(USER_CONTENT, &forwards);
        assert_eq!(
            out,
            "# Some comment\n\
             127.0.0.1       localhost\n\
             ::1             localhost\n\
             \n\
             # KUBETRANSPORT MANAGED\n\
             127.0.16.1 foo.default foo.default.svc foo.default.svc.cluster.local\n\
             # KUBETRANSPORT MANAGED\n"
        );
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let forwards = vec![
            forward("default", "foo", "foo123", 1),
            forward("bang", "baz", "baz-0", 3),
        ];
        let once = render(USER_CONTENT, &forwards);
        let twice = render(&once, &forwards);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_managed_region_replaced_not_accumulated() {
        let forwards_v1 = vec![forward("default", "foo", "foo123", 1)];
        let forwards_v2 = vec![forward("default", "bar", "bar123", 2)];

        let first = render(USER_CONTENT, &forwards_v1);
        let second = render(&first, &forwards_v2);

        assert!(!second.contains("foo.default"));
        assert_eq!(second.matches(MANAGED_MARKER).count(), 2);
        // Exactly one spacer line before the region, no matter how often we
        // rewrite.
        assert!(!second.contains("\n\n\n"));
    }

    #[test]
    fn test_crlf_preserved() {
        let raw = "# comment\r\n127.0.0.1 localhost\r\n";
        let forwards = vec![forward("default", "foo", "foo123", 1)];
        let out = render(raw, &forwards);
        assert!(out.starts_with("# comment\r\n127.0.0.1 localhost\r\n\r\n"));
        assert!(out.contains("# KUBETRANSPORT MANAGED\r\n"));
    }

    #[test]
    fn test_sync_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, USER_CONTENT).unwrap();

        let forwards = vec![forward("default", "foo", "foo123", 1)];
        sync(&path, &forwards).unwrap();
        let after_first = fs::read(&path).unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();

        sync(&path, &forwards).unwrap();
        assert_eq!(fs::read(&path).unwrap(), after_first);
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), mtime);
    }

    #[test]
    fn test_sync_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");

        sync(&path, &[forward("default", "foo", "foo123", 1)]).unwrap();
        let out = fs::read_to_string(&path).unwrap();
        assert!(out.contains("127.0.16.1 foo.default"));
    }

    fn arbitrary_user_lines() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec("[ -~]{0,30}", 0..10).prop_map(|lines| {
            lines
                .into_iter()
                .filter(|l| l != MANAGED_MARKER)
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_rewrite_idempotent(lines in arbitrary_user_lines()) {
            let raw = lines.join("\n");
            let forwards = vec![forward("default", "foo", "foo123", 1)];
            let once = render(&raw, &forwards);
            prop_assert_eq!(render(&once, &forwards), once);
        }

        #[test]
        fn prop_unmanaged_preserved(lines in arbitrary_user_lines()) {
            let raw = lines.join("\n");
            let forwards = vec![forward("default", "foo", "foo123", 1)];
            let before = parse(raw.as_bytes().to_vec());
            let after = parse(render(&raw, &forwards).into_bytes());
            prop_assert_eq!(before.unmanaged(), after.unmanaged());
        }
    }
}
