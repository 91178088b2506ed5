//! End-to-end tests of the `ipcam-stream` binary.
//!
//! Each test runs the real executable against a fake camera, with a shell
//! script standing in for ffmpeg.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use ipcam_engine::test_support::{SourceServer, files_under, wait_for};
use tempfile::TempDir;
use tokio::process::{Child, Command};

/// Concatenates every `-i` input into the last argument.
const CONCAT_ENCODER: &str = r#"#!/bin/sh
inputs=""
while [ $# -gt 1 ]; do
    if [ "$1" = "-i" ]; then
        inputs="$inputs $2"
        shift
    fi
    shift
done
cat $inputs > "$1"
"#;

/// Never finishes within a test.
const STUCK_ENCODER: &str = "#!/bin/sh\nexec sleep 10\n";

struct Setup {
    camera: SourceServer,
    dir: TempDir,
}

impl Setup {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("tmp")).unwrap();
        std::fs::create_dir(dir.path().join("out")).unwrap();
        Self {
            camera: SourceServer::start().await,
            dir,
        }
    }

    fn tmp(&self) -> PathBuf {
        self.dir.path().join("tmp")
    }

    fn out(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    fn encoder(&self, script: &str) -> PathBuf {
        let path = self.dir.path().join("fake-ffmpeg");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn spawn(&self, encoder: &Path, out: &Path) -> Child {
        let live = self.camera.url("/live");
        Command::new(env!("CARGO_BIN_EXE_ipcam-stream"))
            .arg("--len")
            .arg("1")
            .arg("--vurl")
            .arg(live.as_str())
            .arg("--aurl")
            .arg(live.as_str())
            .arg("--tmp")
            .arg(self.tmp())
            .arg("--out")
            .arg(out)
            .arg("--ffmpeg")
            .arg(encoder)
            .arg("--rotate")
            .arg("0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    /// Wait until both halves of the first segment are on disk.
    async fn wait_until_recording(&self) {
        let tmp = self.tmp();
        wait_for(|| files_under(&tmp).len() == 2).await;
    }
}

fn interrupt(child: &Child) {
    let pid = child.id().unwrap();
    let status = std::process::Command::new("kill")
        .arg("-INT")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(status.success());
}

async fn exit_status(child: &mut Child, within: Duration) -> ExitStatus {
    tokio::time::timeout(within, child.wait())
        .await
        .expect("process did not exit in time")
        .unwrap()
}

#[tokio::test]
async fn interrupt_merges_the_open_segment_and_exits_cleanly() {
    let setup = Setup::new().await;
    let encoder = setup.encoder(CONCAT_ENCODER);
    let mut child = setup.spawn(&encoder, &setup.out());

    setup.wait_until_recording().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    interrupt(&child);

    let status = exit_status(&mut child, Duration::from_secs(10)).await;
    assert_eq!(status.code(), Some(0));

    let outputs = files_under(&setup.out());
    assert_eq!(outputs.len(), 1, "unexpected outputs: {outputs:?}");
    assert!(std::fs::metadata(&outputs[0]).unwrap().len() > 0);
    assert!(files_under(&setup.tmp()).is_empty());
}

#[tokio::test]
async fn missing_output_root_exits_with_failure() {
    let setup = Setup::new().await;
    let encoder = setup.encoder(CONCAT_ENCODER);
    let mut child = setup.spawn(&encoder, &setup.dir.path().join("no-such-dir"));

    let status = exit_status(&mut child, Duration::from_secs(10)).await;
    assert_eq!(status.code(), Some(1));
}

#[tokio::test]
async fn second_interrupt_exits_without_waiting_for_the_merge() {
    let setup = Setup::new().await;
    let encoder = setup.encoder(STUCK_ENCODER);
    let mut child = setup.spawn(&encoder, &setup.out());

    setup.wait_until_recording().await;
    interrupt(&child);
    // Let the first signal reach the stuck merge.
    tokio::time::sleep(Duration::from_millis(500)).await;
    interrupt(&child);

    let status = exit_status(&mut child, Duration::from_secs(3)).await;
    assert_eq!(status.code(), Some(130));
    assert!(files_under(&setup.out()).is_empty());
}
