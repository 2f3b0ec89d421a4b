//! Per-client session: the wire-protocol state machine.
//!
//! A session owns one client socket and at most two backend connections (one
//! primary, one replica), all touched from a single task. Messages are
//! forwarded in arrival order and responses relayed back byte-for-byte; the
//! only decisions made here are *which* backend receives each message and
//! *when* the relay stops ([`ReadyForQuery`][protocol::READY_FOR_QUERY]).
//!
//! Routing must honor three stickiness scopes:
//!
//! * a transaction pins the session to the primary until it ends;
//! * `SET`/`RESET` pins the session to the primary for its remaining life;
//! * an extended-query batch pins itself to the destination chosen at
//!   `Parse` until the next `Parse` or simple `Query`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::pool::{PoolManager, PooledConn};
use crate::protocol::{self, Frame, FrontendMessage};
use crate::router::{self, Destination};

mod handshake;

pub use handshake::read_startup;

pub struct Session {
    client: TcpStream,
    remote: SocketAddr,
    pools: Arc<PoolManager>,
    metrics: Arc<Metrics>,
    read_timeout: Duration,
    write_timeout: Duration,
    in_transaction: bool,
    has_session_variables: bool,
    extended_dest: Destination,
    rw: Option<PooledConn>,
    ro: Option<PooledConn>,
}

impl Session {
    pub fn new(
        client: TcpStream,
        remote: SocketAddr,
        pools: Arc<PoolManager>,
        metrics: Arc<Metrics>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Session {
        Session {
            client,
            remote,
            pools,
            metrics,
            read_timeout,
            write_timeout,
            in_transaction: false,
            has_session_variables: false,
            extended_dest: Destination::Primary,
            rw: None,
            ro: None,
        }
    }

    /// Drive the session to completion.
    ///
    /// On return the held backend connections go back to their pools (a
    /// connection that failed was already discarded) and the client socket
    /// closes with the session.
    pub async fn run(mut self) {
        if let Err(err) = self.serve().await {
            self.metrics.record_error();
            warn!(remote = %self.remote, %err, "session terminated");
        }
    }

    async fn serve(&mut self) -> Result<()> {
        self.startup().await?;

        loop {
            let frame = match timed(self.read_timeout, protocol::read_frame(&mut self.client))
                .await
                .map_err(Error::client)?
            {
                Some(frame) => frame,
                // Client went away at a message boundary.
                None => return Ok(()),
            };

            match FrontendMessage::from(frame.ty) {
                FrontendMessage::Query => self.on_query(frame).await?,
                FrontendMessage::Parse => self.on_parse(frame).await?,
                FrontendMessage::Bind
                | FrontendMessage::Execute
                | FrontendMessage::Describe
                | FrontendMessage::Close => self.exchange(self.extended_dest, &frame, false).await?,
                FrontendMessage::Sync => self.exchange(self.extended_dest, &frame, true).await?,
                // Flush promises no ReadyForQuery, so draining here could
                // wedge the session; pending output rides out with the next
                // terminating relay.
                FrontendMessage::Flush => self.exchange(self.extended_dest, &frame, false).await?,
                FrontendMessage::Terminate => {
                    trace!(remote = %self.remote, "client terminated cleanly");
                    return Ok(());
                }
                FrontendMessage::Other(_) => self.exchange(Destination::Primary, &frame, true).await?,
            }
        }
    }

    /// Consume the startup prologue, forward the startup message to a fresh
    /// primary connection, and relay the authentication dialogue.
    async fn startup(&mut self) -> Result<()> {
        let (read_timeout, write_timeout) = (self.read_timeout, self.write_timeout);

        let startup = timed(read_timeout, read_startup(&mut self.client))
            .await
            .map_err(Error::client)?;
        trace!(remote = %self.remote, "startup received");

        let slot = &mut self.rw;
        let conn = match slot.take() {
            Some(conn) => conn,
            None => self.pools.get_rw().await?,
        };
        let conn = slot.insert(conn);

        let res = {
            let backend: &mut TcpStream = conn;
            let client = &mut self.client;
            async {
                timed(write_timeout, backend.write_all(&startup))
                    .await
                    .map_err(Error::upstream)?;
                relay_until_ready(backend, client, read_timeout, write_timeout, true).await
            }
            .await
        };

        if res.is_err() {
            if let Some(bad) = slot.take() {
                bad.close();
            }
        }
        res
    }

    async fn on_query(&mut self, frame: Frame) -> Result<()> {
        let query = protocol::query_text(&frame.body).into_owned();

        let stick = self.in_transaction || self.has_session_variables;
        let dest = router::route(&query, stick);
        self.metrics.record_query(dest);
        debug!(remote = %self.remote, ?dest, %query, "routing query");

        self.exchange(dest, &frame, true).await?;

        if router::is_transaction_start(&query) {
            self.in_transaction = true;
        } else if router::is_transaction_end(&query) {
            self.in_transaction = false;
            if !self.has_session_variables {
                // The replica is no longer pinned out; let another session use it.
                self.ro.take();
            }
        }

        if router::is_session_modification(&query) {
            self.has_session_variables = true;
            self.ro.take();
        }

        Ok(())
    }

    async fn on_parse(&mut self, frame: Frame) -> Result<()> {
        let query = protocol::parse_statement(&frame.body)
            .ok_or_else(|| Error::Protocol("malformed Parse message".into()))?
            .into_owned();

        let stick = self.in_transaction || self.has_session_variables;
        let mut dest = router::route(&query, stick);
        if router::is_session_modification(&query) {
            dest = Destination::Primary;
            self.has_session_variables = true;
        }

        self.extended_dest = dest;
        self.metrics.record_query(dest);
        debug!(remote = %self.remote, ?dest, %query, "routing extended query");

        self.exchange(dest, &frame, false).await
    }

    /// Forward one frame to `dest`, lazily acquiring the backend connection,
    /// and optionally relay responses until `ReadyForQuery`.
    ///
    /// Any failure mid-exchange leaves the backend connection in an unknown
    /// protocol state, so it is discarded rather than returned to its pool.
    async fn exchange(&mut self, dest: Destination, frame: &Frame, drain: bool) -> Result<()> {
        let (read_timeout, write_timeout) = (self.read_timeout, self.write_timeout);

        let slot = match dest {
            Destination::Primary => &mut self.rw,
            Destination::Replica => &mut self.ro,
        };
        let conn = match slot.take() {
            Some(conn) => conn,
            None => match dest {
                Destination::Primary => self.pools.get_rw().await?,
                Destination::Replica => self.pools.get_ro().await?,
            },
        };
        let conn = slot.insert(conn);

        let res = {
            let backend: &mut TcpStream = conn;
            let client = &mut self.client;
            async {
                timed(write_timeout, protocol::write_frame(backend, frame))
                    .await
                    .map_err(Error::upstream)?;
                if drain {
                    relay_until_ready(backend, client, read_timeout, write_timeout, false).await?;
                }
                Ok(())
            }
            .await
        };

        if res.is_err() {
            if let Some(bad) = slot.take() {
                bad.close();
            }
        }
        res
    }
}

/// Relay backend frames to the client until `ReadyForQuery` passes through.
///
/// During the startup exchange an `Authentication` request that expects an
/// answer pauses the relay for exactly one client frame (password, SASL
/// response, ...), which is forwarded without interpretation.
async fn relay_until_ready(
    backend: &mut TcpStream,
    client: &mut TcpStream,
    read_timeout: Duration,
    write_timeout: Duration,
    in_startup: bool,
) -> Result<()> {
    loop {
        let frame = timed(read_timeout, protocol::read_frame(backend))
            .await
            .map_err(Error::upstream)?
            .ok_or_else(|| Error::UpstreamIo(io::ErrorKind::UnexpectedEof.into()))?;

        timed(write_timeout, protocol::write_frame(client, &frame))
            .await
            .map_err(Error::client)?;

        match frame.ty {
            protocol::READY_FOR_QUERY => return Ok(()),
            protocol::AUTHENTICATION
                if in_startup && protocol::authentication_needs_reply(&frame.body) =>
            {
                let reply = timed(read_timeout, protocol::read_frame(client))
                    .await
                    .map_err(Error::client)?
                    .ok_or_else(|| Error::ClientIo(io::ErrorKind::UnexpectedEof.into()))?;
                timed(write_timeout, protocol::write_frame(backend, &reply))
                    .await
                    .map_err(Error::upstream)?;
            }
            _ => {}
        }
    }
}

/// Apply a deadline to one socket operation; expiry surfaces as `TimedOut`.
async fn timed<T, F>(limit: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "i/o deadline exceeded",
        )),
    }
}
