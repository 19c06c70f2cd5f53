//! Copies bytes between one accepted local socket and one forwarded channel.
//!
//! The channel is driven by a dedicated thread, since its reads and writes are
//! blocking library calls. Two tokio tasks move data between the socket and the
//! thread over unbounded queues.

use crate::error::{AppError, AppResult};
use crate::ssh::ForwardChannel;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::watch;

const BUFFER_SIZE: usize = 32 * 1024;
const PUMP_IDLE: Duration = Duration::from_millis(5);

/// Bridge until the remote side closes, the local socket stops accepting
/// writes, or `shutdown` flips.
///
/// Local EOF is a half-close: queued bytes still reach the channel, the channel
/// gets EOF, and the remote reply keeps flowing back. Returns an error only
/// when the channel itself fails.
pub async fn run(
    local: TcpStream,
    channel: Box<dyn ForwardChannel>,
    mut shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    let (mut local_read, mut local_write) = local.into_split();
    let (tx_to_remote, rx_to_remote) = mpsc::unbounded_channel::<Vec<u8>>();
    let (tx_to_local, mut rx_to_local) = mpsc::unbounded_channel::<Vec<u8>>();
    let stop = Arc::new(AtomicBool::new(false));

    let pump = std::thread::spawn({
        let stop = Arc::clone(&stop);
        move || pump(channel, rx_to_remote, tx_to_local, stop)
    });

    // Resolves to `true` on a clean EOF; dropping the sender tells the pump.
    let mut local_to_remote = tokio::spawn(async move {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            match local_read.read(&mut buf).await {
                Ok(0) => return true,
                Ok(n) => {
                    if tx_to_remote.send(buf[..n].to_vec()).is_err() {
                        return true;
                    }
                }
                Err(e) => {
                    tracing::debug!("Local read error: {}", e);
                    return false;
                }
            }
        }
    });

    let mut remote_to_local = tokio::spawn(async move {
        while let Some(data) = rx_to_local.recv().await {
            if local_write.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = local_write.shutdown().await;
    });

    let half_closed = tokio::select! {
        done = &mut local_to_remote => matches!(done, Ok(true)),
        _ = &mut remote_to_local => false,
        _ = wait_shutdown(&mut shutdown) => false,
    };
    if half_closed {
        tracing::trace!("Local side half-closed, draining remote");
        tokio::select! {
            _ = &mut remote_to_local => {}
            _ = wait_shutdown(&mut shutdown) => {}
        }
    }

    stop.store(true, Ordering::SeqCst);
    local_to_remote.abort();
    remote_to_local.abort();

    let result = tokio::task::spawn_blocking(move || pump.join()).await?;
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(AppError::transport("Forwarded channel failed", e)),
        Err(_) => Err(AppError::Tunnel("Forward pump thread panicked".to_string())),
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Drive the channel until the remote side ends, the local writer goes away,
/// or `stop` is set. A closed local queue only sends EOF on the channel.
fn pump(
    mut channel: Box<dyn ForwardChannel>,
    mut rx_to_remote: mpsc::UnboundedReceiver<Vec<u8>>,
    tx_to_local: mpsc::UnboundedSender<Vec<u8>>,
    stop: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut local_open = true;
    let outcome = 'pump: loop {
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }

        while local_open {
            match rx_to_remote.try_recv() {
                Ok(data) => {
                    if let Err(e) = write_fully(channel.as_mut(), &data, &stop) {
                        break 'pump Err(e);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    local_open = false;
                    if let Err(e) = channel.send_eof() {
                        break 'pump Err(e);
                    }
                }
            }
        }

        match channel.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if tx_to_local.send(buf[..n].to_vec()).is_err() {
                    break Ok(());
                }
                continue;
            }
            Err(e) if is_idle(&e) => {}
            Err(e) => break Err(e),
        }

        if channel.is_eof() {
            break Ok(());
        }

        std::thread::sleep(PUMP_IDLE);
    };

    channel.shutdown();
    outcome
}

/// The channel is non-blocking; nothing pending is not an error.
fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

fn write_fully(channel: &mut dyn ForwardChannel, mut data: &[u8], stop: &AtomicBool) -> io::Result<()> {
    while !data.is_empty() {
        match channel.write(data) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if is_idle(&e) => {
                if stop.load(Ordering::SeqCst) {
                    return Ok(());
                }
                std::thread::sleep(PUMP_IDLE);
            }
            Err(e) => return Err(e),
        }
    }
    match channel.flush() {
        Err(e) if !is_idle(&e) => Err(e),
        _ => Ok(()),
    }
}
