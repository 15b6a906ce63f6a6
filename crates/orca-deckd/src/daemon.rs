//! Main daemon orchestration.
//!
//! The [`Daemon`] owns the [`LockController`] and runs a single event loop
//! that multiplexes:
//! - transport events from the serial reader thread
//! - the auto-lock poll interval
//! - control requests from the Unix socket
//! - the shutdown signal
//!
//! Connections are accepted on a separate task, which forwards each parsed
//! request to the loop and writes back the reply. Icon uploads are handed to
//! a blocking task so the loop keeps running while they are paced out.

use std::future::Future;
use std::time::{Duration, Instant};

use orca_deck_core::control::{ErrorCode, Request, Response};
use orca_deck_core::traits::SocketProvider;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::controller::{ControlError, IconJob, LockController, Reply};
use crate::serial::{SerialTransport, TransportEvent, TransportHandle};

/// Control requests waiting for the loop.
const REQUEST_QUEUE: usize = 32;

type Envelope = (Request, oneshot::Sender<Response>);

/// The daemon: controller, transport and control socket.
pub struct Daemon<S: SocketProvider> {
    socket_provider: S,
    controller: LockController,
    transport: SerialTransport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    poll_interval: Duration,
}

impl<S: SocketProvider> Daemon<S> {
    /// Assemble a daemon. `events` must be the receiver paired with the
    /// sender the transport was started with.
    pub fn new(
        socket_provider: S,
        controller: LockController,
        transport: SerialTransport,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            socket_provider,
            controller,
            transport,
            events,
            poll_interval,
        }
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` completes, then lock and stop the transport.
    pub async fn run_until<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.socket_provider.listen().await?;
        info!(
            path = ?self.socket_provider.socket_path(),
            phase = %self.controller.phase(),
            "Daemon listening for control requests"
        );

        let (requests_tx, mut requests_rx) = mpsc::channel::<Envelope>(REQUEST_QUEUE);
        let accept_task = tokio::spawn(accept_loop(listener, requests_tx));

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
                Some(event) = self.events.recv() => {
                    self.controller.handle_transport_event(event);
                }
                Some((request, reply)) = requests_rx.recv() => {
                    self.dispatch(request, reply);
                }
                _ = ticker.tick() => {
                    self.controller.on_tick(Instant::now());
                }
            }
        }

        accept_task.abort();
        self.controller.shutdown();
        let mut transport = self.transport;
        if let Err(e) = tokio::task::spawn_blocking(move || transport.stop()).await {
            error!(error = %e, "Failed to stop serial transport");
        }

        if let Some(path) = self.socket_provider.socket_path() {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "Control socket not removed");
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, request: Request, reply: oneshot::Sender<Response>) {
        match self.controller.handle_request(request) {
            Reply::Now(response) => {
                let _ = reply.send(response);
            }
            Reply::Upload(job) => {
                let handle = self.transport.handle();
                tokio::spawn(async move {
                    let response = run_upload(handle, job).await;
                    let _ = reply.send(response);
                });
            }
        }
    }
}

async fn run_upload(handle: TransportHandle, job: IconJob) -> Response {
    let IconJob { kind, key, icon } = job;
    let started = Instant::now();

    match tokio::task::spawn_blocking(move || handle.upload_icon(kind, key, &icon)).await {
        Ok(Ok(())) => {
            info!(
                kind = %kind,
                key = %key,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Icon uploaded"
            );
            Response::Done
        }
        Ok(Err(e)) => {
            warn!(kind = %kind, key = %key, error = %e, "Icon upload failed");
            ControlError::from(e).into()
        }
        Err(e) => {
            error!(error = %e, "Icon upload task failed");
            Response::error(ErrorCode::InternalError, "icon upload task failed")
        }
    }
}

async fn accept_loop(listener: UnixListener, requests: mpsc::Sender<Envelope>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                debug!("Accepted connection");
                tokio::spawn(handle_connection(stream, requests.clone()));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/// Read one request line, forward it, write one response line.
async fn handle_connection(stream: UnixStream, requests: mpsc::Sender<Envelope>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    match reader.read_line(&mut line).await {
        Ok(0) => {
            debug!("Client disconnected without sending request");
            return;
        }
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "Failed to read request");
            return;
        }
    }

    let response = match Request::parse(line.trim()) {
        Ok(request) => forward(request, &requests).await,
        Err(e) => {
            warn!(error = %e, "Failed to parse request");
            Response::error(ErrorCode::InvalidRequest, e.to_string())
        }
    };

    if let Err(e) = send_response(&mut writer, &response).await {
        error!(error = %e, "Failed to send response");
    }
}

async fn forward(request: Request, requests: &mpsc::Sender<Envelope>) -> Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    if requests.send((request, reply_tx)).await.is_err() {
        return Response::error(ErrorCode::InternalError, "daemon is shutting down");
    }
    reply_rx.await.unwrap_or_else(|_| {
        Response::error(ErrorCode::InternalError, "request dropped before completion")
    })
}

async fn send_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &Response,
) -> anyhow::Result<()> {
    let json = response.to_json_line()?;
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            None
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Cannot listen for SIGINT");
                std::future::pending::<()>().await;
            }
        }
        Some(()) = async {
            match terminate.as_mut() {
                Some(stream) => stream.recv().await,
                None => std::future::pending().await,
            }
        } => {}
    }
}
