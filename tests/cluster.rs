//! End-to-end runs of the `muster` binary: a hand-wired world, a
//! spawned world and a world of one.

use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::process::{Command, Stdio};

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_muster")
}

// Bind-and-drop; the port stays free long enough for the world to
// come up on it.
fn reserve_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

fn write_yaml(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap();
}

#[test]
pub fn four_process_echo_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("work");
    fs::create_dir_all(&workdir).unwrap();

    write_yaml(&dir.path().join("echo.yaml"), "polls: 2\nmarker: ${workdir}/marker\n");
    write_yaml(
        &dir.path().join("cluster.yaml"),
        &format!(
            "
workdir: {}
poll_interval: 1
services:
  probe:
    kind: echo
    ranks: [1, 2]
    config: echo.yaml
",
            workdir.display()
        ),
    );

    let port = reserve_port();
    let mut children = Vec::new();
    for rank in 0..4 {
        let child = Command::new(bin())
            .args(["run", "--config"])
            .arg(dir.path().join("cluster.yaml"))
            .args(["--no-cluster-info", "--poll-interval", "1"])
            .env("RANK", rank.to_string())
            .env("WORLD_SIZE", "4")
            .env("MASTER_ADDR", "127.0.0.1")
            .env("MASTER_PORT", port.to_string())
            .env("MUSTER_CONNECT_TIMEOUT", "60")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        children.push((rank, child));
    }

    for (rank, child) in children {
        let output = child.wait_with_output().unwrap();
        assert!(
            output.status.success(),
            "rank {rank} failed:\n{}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    // World ranks 1 and 2 became group ranks 0 and 1 of the probe
    // task; nobody else ran it.
    let first = fs::read_to_string(workdir.join("marker.0")).unwrap();
    let second = fs::read_to_string(workdir.join("marker.1")).unwrap();
    assert_eq!(first.trim(), "2");
    assert_eq!(second.trim(), "2");
    assert!(!workdir.join("marker.2").exists());
    assert!(!workdir.join("marker.3").exists());
}

#[test]
pub fn spawned_world_runs_a_daemon_and_records_the_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("work");
    let xdg = dir.path().join("xdg");
    fs::create_dir_all(&workdir).unwrap();

    write_yaml(
        &dir.path().join("daemon.yaml"),
        "
start:
  exec: /bin/sh
  args: [\"-c\", \"echo ${masterhostname}\"]
grace: 5
",
    );
    write_yaml(
        &dir.path().join("cluster.yaml"),
        &format!(
            "
workdir: {}
poll_interval: 1
services:
  svc:
    kind: daemon
    ranks: all
    config: daemon.yaml
",
            workdir.display()
        ),
    );

    let port = reserve_port();
    let output = Command::new(bin())
        .args(["spawn", "--nprocs", "2", "--port"])
        .arg(port.to_string())
        .arg("--config")
        .arg(dir.path().join("cluster.yaml"))
        .env("XDG_CONFIG_HOME", &xdg)
        .env("PBS_JOBID", "451.test")
        .env("MUSTER_CONNECT_TIMEOUT", "60")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "spawn failed:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );

    // The daemons echoed the replicated coordinator hostname.
    let hostname = muster::node::hostname().unwrap();
    for rank in 0..2 {
        let log = workdir.join("svc").join(format!("rank-{rank}")).join("stdout.log");
        let logged = fs::read_to_string(&log).unwrap();
        assert_eq!(logged.trim(), hostname, "rank {rank} saw the wrong master");
    }

    // The coordinator recorded the cluster under the batch job id.
    let info_dir = xdg.join("muster.d").join("451.test");
    let jobid = fs::read_to_string(info_dir.join("jobid")).unwrap();
    assert_eq!(jobid.trim(), "451.test");
    let env_script = fs::read_to_string(info_dir.join("env")).unwrap();
    assert!(env_script.contains(&format!("export masterhostname=\"{hostname}\"")));

    let listing = Command::new(bin())
        .arg("list")
        .env("XDG_CONFIG_HOME", &xdg)
        .output()
        .unwrap();
    assert!(listing.status.success());
    assert!(String::from_utf8_lossy(&listing.stdout).contains("451.test\t451.test"));

    let clean = Command::new(bin())
        .args(["clean", "451.test"])
        .env("XDG_CONFIG_HOME", &xdg)
        .output()
        .unwrap();
    assert!(clean.status.success());
    assert!(!info_dir.exists());
}

#[test]
pub fn solo_world_runs_without_a_launcher() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("work");
    fs::create_dir_all(&workdir).unwrap();

    write_yaml(&dir.path().join("echo.yaml"), "marker: ${workdir}/solo\n");
    write_yaml(
        &dir.path().join("cluster.yaml"),
        &format!(
            "
workdir: {}
poll_interval: 1
services:
  probe:
    kind: echo
    ranks: all
    config: echo.yaml
",
            workdir.display()
        ),
    );

    let output = Command::new(bin())
        .args(["run", "--config"])
        .arg(dir.path().join("cluster.yaml"))
        .args(["--no-cluster-info", "--poll-interval", "1"])
        .env_remove("RANK")
        .env_remove("WORLD_SIZE")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "solo run failed:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );

    let written = fs::read_to_string(workdir.join("solo.0")).unwrap();
    assert_eq!(written.trim(), "1");
}
