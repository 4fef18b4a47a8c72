//! One tunneled TCP connection.
//!
//! The pump owns the local socket and moves data both ways:
//! - local reads are batched into bundles, flushed on local EOF, when the
//!   bundle is full, or once the coalescing delay has passed since its first
//!   byte
//! - in-order bundles from the delivery queue are written to the socket
//!
//! A send refused with backpressure keeps the pending bundle as is and stops
//! reading the socket until a retry succeeds. Sequence numbers are consumed
//! only by successful sends, so nothing is lost or sent twice.

use socket2::SockRef;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::coordinator::{ConnectionError, Coordinator, TunnelSettings};
use crate::flow::{FlowEndpoint, FlowHandle, InboundBundle};
use crate::proto::{BundleHeader, Protocol};
use crate::tproxy;

/// How long the first pass waits for client data before sending an empty
/// opening bundle
const OPENING_WAIT: Duration = Duration::from_secs(1);

/// Bundle being assembled from local reads
struct Outgoing {
    buf: Vec<u8>,
    /// Bytes used, header prefix included
    len: usize,
    /// When the first body byte was read
    started: Option<Instant>,
    eof: bool,
    /// Created on the first pass to open the flow at the far end
    opening: bool,
}

impl Outgoing {
    fn new(max_size: usize, opening: bool) -> Self {
        Self {
            buf: vec![0; max_size],
            len: BundleHeader::SIZE,
            started: None,
            eof: false,
            opening,
        }
    }

    fn body_len(&self) -> usize {
        self.len - BundleHeader::SIZE
    }

    fn is_full(&self) -> bool {
        self.len >= self.buf.len()
    }

    fn is_due(&self, delay: Duration, now: Instant) -> bool {
        self.eof
            || self.is_full()
            || self
                .started
                .map_or(true, |t| now.saturating_duration_since(t) >= delay)
    }

    fn seal(&mut self, header: &BundleHeader) -> &[u8] {
        self.buf[..BundleHeader::SIZE].copy_from_slice(&header.encode());
        &self.buf[..self.len]
    }
}

enum Event {
    Cancelled,
    Delivery(Option<InboundBundle>),
    Readable(io::Result<()>),
    Timeout,
}

pub(crate) struct TcpConnection {
    coord: Weak<Coordinator>,
    handle: Arc<FlowHandle>,
    endpoint: FlowEndpoint,
    settings: TunnelSettings,
    /// Header for outgoing bundles, sequence and eof filled in per bundle
    template: BundleHeader,
    send_seqno: u32,
    next_recv_seqno: u32,
    /// Local side reached EOF
    sock_eof: bool,
}

impl TcpConnection {
    pub(crate) fn new(
        coord: &Arc<Coordinator>,
        handle: Arc<FlowHandle>,
        endpoint: FlowEndpoint,
    ) -> Self {
        let key = handle.key();
        let template = BundleHeader::new(Protocol::Tcp, key.connection_id, key.client, key.remote);
        Self {
            coord: coord.downgrade(),
            settings: coord.settings().clone(),
            handle,
            endpoint,
            template,
            send_seqno: 0,
            next_recv_seqno: 0,
            sock_eof: false,
        }
    }

    /// Pump an accepted local connection
    pub(crate) fn spawn_local(self, stream: TcpStream) {
        tokio::spawn(self.run(Some(stream)));
    }

    /// Connect to the flow's remote address, then pump
    pub(crate) fn spawn_remote(self) {
        tokio::spawn(self.run(None));
    }

    async fn run(mut self, stream: Option<TcpStream>) {
        let key = self.handle.key().clone();
        let result = match stream {
            Some(stream) => self.pump(stream).await,
            None => self.open_remote().await,
        };
        match result {
            Ok(()) => info!("{key} connection closed"),
            Err(e) => error!("{key} connection terminated: {e}"),
        }

        if let Some(coord) = self.coord.upgrade() {
            coord.tcp().table().unregister(&self.handle);
        }
    }

    async fn open_remote(&mut self) -> Result<(), ConnectionError> {
        let source = self.settings.transparent.then_some(self.template.client);
        let remote = self.template.remote;
        let Some(connected) = self
            .endpoint
            .cancel
            .guard(tproxy::tcp_connect(source, remote))
            .await
        else {
            return Ok(());
        };

        match connected {
            Ok(stream) => {
                if let Err(e) = tproxy::set_buffer_sizes(
                    SockRef::from(&stream),
                    self.settings.recv_bufsize,
                    self.settings.send_bufsize,
                ) {
                    warn!("{} failed to set socket buffer sizes: {e}", self.handle.key());
                }
                self.pump(stream).await
            }
            Err(e) => {
                warn!("{} error connecting to {remote}: {e}", self.handle.key());
                // Tell the initiating side to give up on the flow
                let mut header = self.template.with_seqno(self.send_seqno);
                header.eof = true;
                self.send_retrying(&header.encode()).await?;
                Ok(())
            }
        }
    }

    fn coordinator(&self) -> Result<Arc<Coordinator>, ConnectionError> {
        self.coord.upgrade().ok_or(ConnectionError::CoordinatorGone)
    }

    /// Send, waiting out backpressure; false if the connection was aborted
    async fn send_retrying(&mut self, bundle: &[u8]) -> Result<bool, ConnectionError> {
        let coord = self.coordinator()?;
        let sent = coord
            .send_retrying(bundle, &self.handle.key().peer, &mut self.endpoint.cancel)
            .await?;
        if sent {
            self.send_seqno = self.send_seqno.wrapping_add(1);
        }
        Ok(sent)
    }

    async fn pump(&mut self, mut stream: TcpStream) -> Result<(), ConnectionError> {
        let delay = self.settings.delay;
        let mut outgoing: Option<Outgoing> = None;
        let mut first = true;
        let mut retry_at: Option<Instant> = None;

        loop {
            if self.endpoint.cancel.is_cancelled() {
                debug!("{} aborted", self.handle.key());
                return Ok(());
            }

            let deadline = if retry_at.is_some() {
                retry_at
            } else if first {
                Some(Instant::now() + OPENING_WAIT)
            } else {
                outgoing.as_ref().and_then(|o| o.started).map(|t| t + delay)
            };
            let watch_socket = !self.sock_eof && retry_at.is_none();

            let event = tokio::select! {
                _ = self.endpoint.cancel.cancelled() => Event::Cancelled,
                item = self.endpoint.deliveries.recv() => Event::Delivery(item),
                ready = stream.readable(), if watch_socket => Event::Readable(ready),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    Event::Timeout
                }
            };

            let (readable, delivery) = match event {
                Event::Cancelled => {
                    debug!("{} aborted", self.handle.key());
                    return Ok(());
                }
                Event::Readable(ready) => {
                    ready?;
                    (true, None)
                }
                Event::Delivery(item) => (false, Some(item)),
                Event::Timeout => (false, None),
            };

            // The first pass always produces a bundle so the far end learns
            // about the flow even if the client stays silent.
            if (first || readable) && outgoing.is_none() {
                outgoing = Some(Outgoing::new(self.settings.max_size, first));
            }
            first = false;

            if readable {
                let mut discard = false;
                if let Some(out) = outgoing.as_mut().filter(|o| !o.is_full()) {
                    let start = out.len;
                    match stream.try_read(&mut out.buf[start..]) {
                        Ok(0) => {
                            debug!("{} local eof", self.handle.key());
                            out.eof = true;
                            self.sock_eof = true;
                        }
                        Ok(n) => {
                            out.len += n;
                            out.started.get_or_insert_with(Instant::now);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            discard = !out.opening && out.started.is_none();
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                if discard {
                    outgoing = None;
                }
            }

            let now = Instant::now();
            let may_send = retry_at.map_or(true, |at| now >= at);
            let mut sent = false;
            if let Some(out) = outgoing.as_mut().filter(|o| may_send && o.is_due(delay, now)) {
                let mut header = self.template.with_seqno(self.send_seqno);
                header.eof = out.eof;
                let body_len = out.body_len();
                let coord = self.coordinator()?;
                match coord.send(out.seal(&header), &self.handle.key().peer).await {
                    Ok(()) => {
                        debug!(
                            "{} sent seq {} ({body_len} bytes, eof={})",
                            self.handle.key(),
                            header.seqno,
                            header.eof
                        );
                        self.send_seqno = self.send_seqno.wrapping_add(1);
                        retry_at = None;
                        sent = true;
                    }
                    Err(e) if e.is_backpressure() => {
                        debug!(
                            "{} transport full, holding seq {} ({body_len} bytes)",
                            self.handle.key(),
                            header.seqno
                        );
                        retry_at = Some(now + self.settings.backpressure_retry);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if sent {
                outgoing = None;
            }

            let Some(item) = delivery else { continue };
            let Some(bundle) = item else {
                return Ok(());
            };

            if bundle.header.seqno != self.next_recv_seqno {
                return Err(ConnectionError::OutOfOrder {
                    got: bundle.header.seqno,
                    expected: self.next_recv_seqno,
                });
            }
            self.next_recv_seqno = self.next_recv_seqno.wrapping_add(1);

            if !bundle.body.is_empty() {
                match self.endpoint.cancel.guard(stream.write_all(&bundle.body)).await {
                    Some(written) => written?,
                    None => return Ok(()),
                }
            }

            if bundle.header.eof {
                info!("{} remote eof, closing", self.handle.key());
                self.finish(outgoing.take()).await?;
                let _ = stream.shutdown().await;
                return Ok(());
            }
        }
    }

    /// Make sure the far end gets our EOF before the socket closes.
    ///
    /// A bundle still pending is flushed with its eof flag set; otherwise an
    /// empty eof bundle is sent unless one already went out.
    async fn finish(&mut self, pending: Option<Outgoing>) -> Result<(), ConnectionError> {
        match pending {
            Some(mut out) => {
                let mut header = self.template.with_seqno(self.send_seqno);
                header.eof = true;
                out.eof = true;
                let bundle = out.seal(&header).to_vec();
                self.send_retrying(&bundle).await?;
            }
            None if !self.sock_eof => {
                let mut header = self.template.with_seqno(self.send_seqno);
                header.eof = true;
                self.send_retrying(&header.encode()).await?;
            }
            None => {}
        }
        self.sock_eof = true;
        Ok(())
    }
}
