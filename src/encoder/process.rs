//! External encoder process: spawn, output readers and graceful shutdown.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::packet::{AnnexBPacketizer, EncodedPacket, PacketRingBuffer, RingStats};
use crate::EncoderError;

const READ_CHUNK_BYTES: usize = 64 * 1024;
const EXIT_TIMEOUT: Duration = Duration::from_secs(2);
const READER_TIMEOUT: Duration = Duration::from_millis(500);
const STDERR_HINT_LINES: usize = 8;

/// Counters shared by a backend, its writer task and its reader tasks.
#[derive(Debug)]
pub(crate) struct EncoderCounters {
    pub input_bytes: AtomicU64,
    pub packets: AtomicU64,
    pub packet_bytes: AtomicU64,
    pub restarts: AtomicU64,
    pub queue_drops: AtomicU64,
    pub queued_buffers: AtomicI64,
    pub last_frame_ts: AtomicI64,
    pub gpu_copy_failures: AtomicU64,
    pub stderr_chars: AtomicU64,
    stderr_hints: Mutex<VecDeque<String>>,
    epoch: Instant,
}

impl Default for EncoderCounters {
    fn default() -> Self {
        Self {
            input_bytes: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            packet_bytes: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            queue_drops: AtomicU64::new(0),
            queued_buffers: AtomicI64::new(0),
            last_frame_ts: AtomicI64::new(0),
            gpu_copy_failures: AtomicU64::new(0),
            stderr_chars: AtomicU64::new(0),
            stderr_hints: Mutex::new(VecDeque::new()),
            epoch: Instant::now(),
        }
    }
}

impl EncoderCounters {
    /// Records a frame fully written to the encoder's stdin.
    pub fn frame_written(&self, bytes: usize, timestamp_ms: i64) {
        self.input_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_frame_ts.store(timestamp_ms, Ordering::Relaxed);
    }

    /// Timestamp for packets read now: the capture time of the last frame
    /// written, or the backend's own clock before any frame went in.
    pub fn packet_timestamp(&self) -> i64 {
        let ts = self.last_frame_ts.load(Ordering::Relaxed);
        if ts > 0 {
            ts
        } else {
            i64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(i64::MAX)
        }
    }

    fn record_packets(&self, ring: &PacketRingBuffer, packets: &[EncodedPacket]) {
        for packet in packets {
            ring.append(packet);
            self.packets.fetch_add(1, Ordering::Relaxed);
            self.packet_bytes
                .fetch_add(packet.len() as u64, Ordering::Relaxed);
        }
    }

    fn record_stderr(&self, line: &str) {
        self.stderr_chars
            .fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let mut hints = self.stderr_hints.lock();
        if hints.len() == STDERR_HINT_LINES {
            hints.pop_front();
        }
        hints.push_back(trimmed.to_string());
    }

    /// Most recent diagnostic line printed by the encoder process.
    pub fn last_stderr(&self) -> Option<String> {
        self.stderr_hints.lock().back().cloned()
    }

    /// `key=value` diagnostic line.
    pub fn status_line(&self, codec: &str, running: bool, ring: RingStats) -> String {
        format!(
            "codec={codec};running={running};inputBytes={};packets={};packetBytes={};\
             ringPackets={};ringBytes={};restarts={};queueDrops={};queuedBuffers={};\
             lastFrameTs={};gpuCopyFailures={};stderrChars={}",
            self.input_bytes.load(Ordering::Relaxed),
            self.packets.load(Ordering::Relaxed),
            self.packet_bytes.load(Ordering::Relaxed),
            ring.packets,
            ring.bytes,
            self.restarts.load(Ordering::Relaxed),
            self.queue_drops.load(Ordering::Relaxed),
            self.queued_buffers.load(Ordering::Relaxed).max(0),
            self.last_frame_ts.load(Ordering::Relaxed),
            self.gpu_copy_failures.load(Ordering::Relaxed),
            self.stderr_chars.load(Ordering::Relaxed),
        )
    }
}

/// A running encoder process and the tasks draining its output.
///
/// The stdout reader owns a fresh packetizer per process, so a restart
/// never splices bytes from two processes into one unit. The ring buffer
/// is shared across restarts.
#[derive(Debug)]
pub(crate) struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl EncoderProcess {
    /// Launches `program` and starts draining stdout into `ring`.
    pub fn spawn(
        program: &Path,
        args: &[String],
        ring: Arc<PacketRingBuffer>,
        counters: Arc<EncoderCounters>,
    ) -> Result<Self, EncoderError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncoderError::ProcessSpawn {
                program: program.to_path_buf(),
                source,
            })?;

        tracing::debug!(
            program = %program.display(),
            pid = child.id(),
            ?args,
            "encoder process spawned"
        );

        let stdin = child.stdin.take();
        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_encoded_output(stdout, ring, Arc::clone(&counters))));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, counters)));

        Ok(Self {
            child,
            stdin,
            stdout_task,
            stderr_task,
        })
    }

    /// Hands out the process's stdin. Returns `None` after the first call.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Closes stdin, waits for exit (killing after a timeout) and then for
    /// the output readers, which flush the final unit into the ring.
    pub async fn shutdown(mut self) {
        drop(self.stdin.take());

        match tokio::time::timeout(EXIT_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "encoder process exited"),
            Ok(Err(e)) => tracing::warn!("Failed to wait for encoder process: {e}"),
            Err(_) => {
                tracing::warn!("encoder process did not exit in time, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!("Failed to kill encoder process: {e}");
                }
            }
        }

        let readers = [self.stdout_task.take(), self.stderr_task.take()]
            .into_iter()
            .flatten()
            .map(|task| join_with_timeout(task, READER_TIMEOUT));
        futures::future::join_all(readers).await;
    }
}

/// Waits for `task`, aborting it after `timeout`.
pub(crate) async fn join_with_timeout(mut task: JoinHandle<()>, timeout: Duration) {
    if tokio::time::timeout(timeout, &mut task).await.is_err() {
        task.abort();
        let _ = task.await;
    }
}

async fn read_encoded_output(
    mut stdout: ChildStdout,
    ring: Arc<PacketRingBuffer>,
    counters: Arc<EncoderCounters>,
) {
    let mut packetizer = AnnexBPacketizer::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("encoder stdout read failed: {e}");
                break;
            }
        };
        let ts = counters.packet_timestamp();
        let packets = packetizer.push(&buf[..n], ts, ts);
        counters.record_packets(&ring, &packets);
    }

    let ts = counters.packet_timestamp();
    let tail = packetizer.flush(ts, ts);
    counters.record_packets(&ring, &tail);

    if packetizer.discarded_bytes() > 0 {
        tracing::warn!(
            discarded = packetizer.discarded_bytes(),
            "encoder output contained unframed bytes"
        );
    }
}

async fn drain_stderr(stderr: ChildStderr, counters: Arc<EncoderCounters>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!("ffmpeg: {}", line.trim());
                counters.record_stderr(&line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("encoder stderr read failed: {e}");
                break;
            }
        }
    }
}
