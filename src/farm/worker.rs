use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::gateway::{execute, GatewayCall, GatewayReply, SessionGateway};
use super::ui::error;

const WORKER_THREADS: usize = 2;
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Runs gateway calls off the driver thread. Two threads so a slow stop or start never
/// holds up the periodic polls behind it.
pub struct GatewayWorker {
    handles: Vec<JoinHandle<()>>,
    call_tx: Option<Sender<GatewayCall>>,
    reply_rx: Receiver<GatewayReply>,
    done_rx: Receiver<()>,
    shutdown: Arc<AtomicBool>,
}

impl GatewayWorker {
    pub fn spawn(gateway: Arc<dyn SessionGateway>) -> Result<Self> {
        let (call_tx, call_rx) = unbounded::<GatewayCall>();
        let (reply_tx, reply_rx) = unbounded::<GatewayReply>();
        let (done_tx, done_rx) = unbounded::<()>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(WORKER_THREADS);
        for idx in 0..WORKER_THREADS {
            let gateway = Arc::clone(&gateway);
            let call_rx = call_rx.clone();
            let reply_tx = reply_tx.clone();
            let done_tx = done_tx.clone();
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("farmhand-gateway-{idx}"))
                .spawn(move || {
                    while !shutdown.load(Ordering::Relaxed) {
                        let call = match call_rx.recv_timeout(IDLE_WAIT) {
                            Ok(call) => call,
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        };
                        if reply_tx.send(execute(gateway.as_ref(), call)).is_err() {
                            break;
                        }
                    }
                    let _ = done_tx.send(());
                })
                .context("failed to spawn gateway worker thread")?;
            handles.push(handle);
        }

        Ok(Self {
            handles,
            call_tx: Some(call_tx),
            reply_rx,
            done_rx,
            shutdown,
        })
    }

    pub fn submit(&self, call: GatewayCall) -> Result<()> {
        let Some(call_tx) = self.call_tx.as_ref() else {
            return Err(anyhow!("gateway worker is shut down"));
        };
        let label = call.label();
        call_tx
            .send(call)
            .map_err(|_| anyhow!("gateway worker stopped before {label} call"))
    }

    pub fn try_recv(&self) -> Option<GatewayReply> {
        match self.reply_rx.try_recv() {
            Ok(reply) => Some(reply),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn replies(&self) -> &Receiver<GatewayReply> {
        &self.reply_rx
    }

    /// Closes the queue and waits up to `wait` for the threads to finish their current
    /// call. Threads still blocked on the network are detached.
    pub fn shutdown_for(&mut self, wait: Duration) -> bool {
        self.call_tx = None;
        self.shutdown.store(true, Ordering::Relaxed);
        let wait = wait.max(Duration::from_millis(1));

        let mut finished = 0usize;
        while finished < self.handles.len() {
            match self.done_rx.recv_timeout(wait) {
                Ok(()) => finished += 1,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    finished = self.handles.len();
                }
            }
        }

        let done = finished >= self.handles.len();
        for handle in self.handles.drain(..) {
            if done {
                if handle.join().is_err() {
                    error("GATEWAY", "gateway worker thread panicked");
                }
            } else {
                drop(handle);
            }
        }
        done
    }
}

impl Drop for GatewayWorker {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown_for(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::farm::gateway::testing::ScriptedGateway;

    #[test]
    fn executes_calls_and_returns_replies() {
        let gateway = Arc::new(ScriptedGateway::with_workers(2));
        let mut worker = GatewayWorker::spawn(gateway.clone()).expect("spawn worker");
        worker.submit(GatewayCall::Overview).expect("submit overview");

        let reply = worker
            .replies()
            .recv_timeout(Duration::from_secs(2))
            .expect("overview reply");
        assert!(matches!(reply, GatewayReply::Overview { result: Ok(_) }));
        assert_eq!(gateway.count("overview"), 1);
        assert!(worker.shutdown_for(Duration::from_secs(2)));
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let gateway = Arc::new(ScriptedGateway::default());
        let mut worker = GatewayWorker::spawn(gateway).expect("spawn worker");
        assert!(worker.shutdown_for(Duration::from_secs(2)));
        assert!(worker.submit(GatewayCall::Overview).is_err());
        assert!(worker.try_recv().is_none());
    }
}
