//! Worker accounting and the per-connection I/O task.
//!
//! Each live connection is driven by exactly one I/O task that owns both
//! socket halves: it reads chunks into the receive buffer and hands them
//! to the layer hook, drains the send queue, applies the idle timeout,
//! and reacts to control messages. Connections are charged against
//! worker slots picked by least-loaded selection; worker 0 doubles as
//! the dispatcher.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration, Instant};

use crate::pool::conn::{ConnCtrl, ConnMode, ConnRef};
use crate::pool::{DispCmd, PoolShared};

/// Per-worker bookkeeping owned by the dispatcher. Slot 0 is the
/// dispatcher itself.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    /// Number of connections currently charged to this worker.
    pub nconn: usize,
}

impl WorkerSlot {
    pub(crate) fn new() -> Self {
        Self { nconn: 0 }
    }
}

/// Pick the worker with the fewest connections, ties to the lowest index.
pub(crate) fn select_worker(workers: &[WorkerSlot]) -> usize {
    let mut idx = 0;
    let mut best = workers[0].nconn;
    for (i, w) in workers.iter().enumerate() {
        if w.nconn < best {
            best = w.nconn;
            idx = i;
        }
    }
    idx
}

/// Drive one connection's socket until it dies, then report teardown.
pub(crate) async fn run_io(shared: Arc<PoolShared>, conn: ConnRef, stream: TcpStream) {
    let seg_buff_size = shared.cfg.seg_buff_size;
    let handler = shared.handler.clone();

    let (mut rd, mut wr) = stream.into_split();

    let mut send_rx = match conn.send_rx.lock().unwrap().take() {
        Some(rx) => rx,
        None => return,
    };
    let mut ctrl_rx = match conn.ctrl_rx.lock().unwrap().take() {
        Some(rx) => rx,
        None => return,
    };

    let mut buf = BytesMut::with_capacity(seg_buff_size);
    let mut idle: Option<Duration> = None;
    let timeout = sleep(Duration::from_secs(86400));
    tokio::pin!(timeout);

    loop {
        let mut limited = (&mut buf).limit(seg_buff_size);
        tokio::select! {
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(ConnCtrl::ResetTimeout(d)) => {
                    idle = Some(d);
                    timeout.as_mut().reset(Instant::now() + d);
                }
                Some(ConnCtrl::Terminate) | None => {
                    tracing::debug!(conn = %conn, "terminated");
                    break;
                }
            },

            res = rd.read_buf(&mut limited), if !conn.reads_paused() => match res {
                Ok(0) => {
                    tracing::debug!(conn = %conn, "closed by remote");
                    break;
                }
                Ok(_) => {
                    if let Some(d) = idle {
                        timeout.as_mut().reset(Instant::now() + d);
                    }
                    if let Err(e) = handler.on_read(&conn, &mut buf).await {
                        tracing::warn!(conn = %conn, error = %e, "protocol violation");
                        shared.report_error(e, false, 0);
                        break;
                    }
                    buf.reserve(seg_buff_size);
                }
                Err(e) => {
                    tracing::debug!(conn = %conn, error = %e, "read error");
                    break;
                }
            },

            // Reads were suspended; frames already buffered may now
            // complete without new socket data.
            _ = conn.read_resumed() => {
                if let Err(e) = handler.on_read(&conn, &mut buf).await {
                    tracing::warn!(conn = %conn, error = %e, "protocol violation");
                    shared.report_error(e, false, 0);
                    break;
                }
                buf.reserve(seg_buff_size);
            },

            seg = send_rx.recv() => match seg {
                Some(data) => {
                    if let Err(e) = wr.write_all(&data).await {
                        tracing::debug!(conn = %conn, error = %e, "write error");
                        conn.stash_unsent(data);
                        break;
                    }
                    // Drain whatever else is already queued
                    let mut failed = None;
                    while let Some(next) = send_rx.try_recv() {
                        if let Err(e) = wr.write_all(&next).await {
                            tracing::debug!(conn = %conn, error = %e, "write error");
                            failed = Some(next);
                            break;
                        }
                    }
                    if let Some(data) = failed {
                        conn.stash_unsent(data);
                        break;
                    }
                }
                None => break,
            },

            _ = &mut timeout, if idle.is_some() => {
                tracing::info!(conn = %conn, "connection timeout");
                break;
            }
        }
    }

    conn.set_mode(ConnMode::Dead);

    // Recover anything still queued so a successor connection can
    // take it over; close first so late writers see failure.
    send_rx.close();
    while let Some(data) = send_rx.try_recv() {
        conn.stash_unsent(data);
    }

    let _ = shared.disp_tx.send(DispCmd::Teardown { conn });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_worker_least_loaded() {
        let mut workers = vec![
            WorkerSlot::new(),
            WorkerSlot::new(),
            WorkerSlot::new(),
        ];
        workers[0].nconn = 2;
        workers[1].nconn = 1;
        workers[2].nconn = 3;

        assert_eq!(select_worker(&workers), 1);
    }

    #[test]
    fn test_select_worker_ties_to_lowest_index() {
        let mut workers = vec![
            WorkerSlot::new(),
            WorkerSlot::new(),
            WorkerSlot::new(),
        ];
        workers[0].nconn = 1;
        workers[1].nconn = 1;
        workers[2].nconn = 1;

        assert_eq!(select_worker(&workers), 0);
    }

    #[test]
    fn test_select_worker_single() {
        let workers = vec![WorkerSlot::new()];
        assert_eq!(select_worker(&workers), 0);
    }
}
