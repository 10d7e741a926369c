use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::Framed;
use crate::{
    block::{Block, BlockRequest},
    piece_store::PieceOutcome,
    torrent::{TorrentCommand, TorrentContext},
    Bitfield,
};
use super::{handshake::*, message::*, state::*, PeerCommand, PeerError, PeerRx, PeerTx};

type Result<T> = std::result::Result<T, PeerError>;
type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))
    }
}

impl From<crate::piece_store::PieceStoreError> for PeerError {
    fn from(e: crate::piece_store::PieceStoreError) -> Self {
        PeerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

#[derive(Debug)]
pub struct PeerSession {

    // The peer's address.
    address: SocketAddr,

    // Read-only state shared by every session of this torrent.
    torrent_ctx: Arc<TorrentContext>,

    // Commands from the torrent/handle to this session.
    peer_rx: PeerRx,

    // Our own sender clone, handed out to callers that want to command us.
    peer_tx: PeerTx,

    // Blocks the peer has asked us for.
    requests_in: HashSet<BlockRequest>,

    // Blocks we've asked the peer for, each with the instant it was sent.
    requests_out: HashMap<BlockRequest, Instant>,

    // The peer's advertised bitfield.
    bitfield: Bitfield,

    state: SessionState,

}

impl PeerSession {

    pub fn new(address: SocketAddr, torrent_ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, torrent_ctx.layout.num_pieces as usize);

        (
            PeerSession {
                address,
                torrent_ctx,
                peer_rx,
                peer_tx: peer_tx.clone(),
                bitfield,
                state: SessionState::default(),
                requests_in: HashSet::new(),
                requests_out: HashMap::new(),
            },
            peer_tx,
        )
    }

    // `stream` is `Some` for both a listener-accepted connection and an
    // already-dialed outbound one; `inbound` is the only thing that decides
    // which side speaks first in the handshake, so it is always passed
    // explicitly rather than inferred from whether a stream was handed in.
    #[tracing::instrument(name = "peer", skip(self, stream), fields(address = %self.address))]
    pub async fn start_session(&mut self, stream: Option<TcpStream>, inbound: bool) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Connecting);
        debug_assert!(stream.is_some() || !inbound, "an inbound session must already have an accepted stream");
        let mut socket = if let Some(stream) = stream {
            Framed::new(stream, HandshakeCodec)
        } else {
            let timeout = Duration::from_secs(10);
            let stream = time::timeout(timeout, TcpStream::connect(self.address))
                .await
                .map_err(|_| PeerError::Timeout)??;
            tracing::trace!("outbound connection successful");
            Framed::new(stream, HandshakeCodec)
        };

        self.exchange_handshake(&mut socket, inbound).await?;

        let socket = Framed::new(socket.into_inner(), MessageCodec);
        self.run(socket).await
    }

    pub async fn disconnect(&mut self) {
        self.state.update(|state| *state = SessionState::default());
        self.torrent_ctx.torrent_tx.send(TorrentCommand::PeerState {
            address: self.address,
            state: self.state,
        }).ok();
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>, inbound: bool) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let handshake = Handshake::new(self.torrent_ctx.descriptor_id, self.torrent_ctx.client_id);

        if !inbound {
            tracing::debug!("send handshake");
            socket.send(handshake).await?;
        }

        tracing::trace!("waiting for handshake");
        if let Some(Ok(peer_handshake)) = socket.next().await {
            tracing::debug!("read handshake");

            if peer_handshake.protocol != PROTOCOL {
                return Err(PeerError::IncorrectProtocol);
            }
            if peer_handshake.descriptor_id != self.torrent_ctx.descriptor_id {
                return Err(PeerError::HandshakeIdMismatch);
            }

            if inbound {
                tracing::debug!("send handshake");
                let reply = Handshake::new(self.torrent_ctx.descriptor_id, self.torrent_ctx.client_id);
                socket.send(reply).await?;
            }

            self.torrent_ctx.torrent_tx.send(TorrentCommand::PeerConnected {
                address: self.address,
                id: peer_handshake.peer_id,
            })?;

            tracing::info!("handshake successful, peer connected");
            Ok(())

        } else {
            Err(PeerError::NoHandshake)
        }
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.state.connect_time = Some(Instant::now());
        self.state.update(|state| state.conn_state = ConnState::Introducing);
        let (mut sink, mut stream) = socket.split();

        // BITFIELD, if sent at all, must be the first message after the
        // handshake: send ours unconditionally, ahead of anything else.
        let own_bitfield = self.torrent_ctx.picker.piece_picker.read().await.own_bitfield().clone();
        self.send_message(&mut sink, Message::Bitfield(own_bitfield)).await?;

        let mut commits_rx = self.torrent_ctx.store.subscribe_commits();
        let mut ticker = time::interval(Duration::from_secs(1));

        loop { tokio::select! {

            // Message from peer.
            msg = stream.next() => match msg {
                Some(Ok(msg)) => self.handle_msg(&mut sink, msg).await?,
                Some(Err(e)) => return Err(e),
                None => break,
            },

            // Command from the handle / torrent task.
            Some(cmd) = self.peer_rx.recv() => {
                match cmd {
                    PeerCommand::Shutdown => {
                        tracing::info!("session shutdown requested");
                        break;
                    }
                }
            }

            // A piece committed somewhere (possibly via another peer); tell
            // this one about it and drop any now-redundant requests.
            Ok(idx) = commits_rx.recv() => self.handle_written_piece(&mut sink, idx).await?,

            t = ticker.tick() => self.tick(&mut sink, t.into_std()).await?,

        }}

        Ok(())
    }

    #[inline(always)]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("read: {}", msg);

        match msg {

            Message::Bitfield(bitfield) => {
                if self.state.conn_state == ConnState::Introducing {
                    self.handle_bitfield(sink, bitfield).await?;
                } else {
                    tracing::error!("unexpected bitfield outside of introduction");
                    return Err(PeerError::UnexpectedBitfield);
                }
            }

            Message::KeepAlive => {}

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.peer_choking = true;
                    self.free_requests_out().await;
                }
            }

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.peer_choking = false;
                    if self.state.interested {
                        self.make_requests(sink).await?;
                    }
                }
            }

            Message::Interested => {
                if !self.state.peer_interested {
                    self.state.peer_interested = true;
                    self.send_message(sink, Message::Unchoke).await?;
                    self.state.choked = false;
                }
            }

            Message::NotInterested => self.state.peer_interested = false,

            Message::Piece(block) => self.handle_block(sink, block).await?,

            Message::Request(request) => self.handle_request(sink, request).await?,

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Cancel(request) => self.handle_cancel(request).await?,

        }

        if self.state.conn_state == ConnState::Introducing {
            if self.torrent_ctx.picker.piece_picker.read().await.own_bitfield().not_any()
                && self.bitfield.not_any()
            {
                tracing::warn!("neither side has any pieces; closing connection");
                self.peer_tx.send(PeerCommand::Shutdown)?;
                return Ok(());
            }
            self.state.update(|state| state.conn_state = ConnState::Connected);
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, bitfield: Bitfield) -> Result<()> {
        let num_pieces = self.torrent_ctx.layout.num_pieces as usize;

        if bitfield.len() < num_pieces {
            tracing::error!("bitfield shorter than the piece count");
            return Err(PeerError::InvalidMessage);
        }
        // Any padding bit beyond the last real piece being set is malformed.
        if bitfield[num_pieces..].any() {
            tracing::error!("bitfield has set padding bits beyond the piece count");
            return Err(PeerError::InvalidMessage);
        }

        let mut bitfield = bitfield;
        bitfield.truncate(num_pieces);

        tracing::info!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);
        let interested = self.torrent_ctx.picker.piece_picker.write().await.bitfield_update(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_ones());
        self.bitfield = bitfield;
        self.update_interest(sink, interested).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        if idx >= self.torrent_ctx.layout.num_pieces {
            tracing::error!(idx, "have with out-of-range piece index");
            return Err(PeerError::InvalidMessage);
        }
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.state.update(|state| state.num_pieces += 1);

        let interested = self.torrent_ctx.picker.piece_picker.write().await.increment_piece(idx as usize);
        self.update_interest(sink, interested).await
    }

    async fn handle_block(&mut self, sink: &mut MessageSink, block: Block) -> Result<()> {

        let request = BlockRequest::from_block(&block);
        if !request.is_valid(&self.torrent_ctx.layout) {
            tracing::error!(?request, "piece frame out of bounds");
            return Err(PeerError::InvalidMessage);
        }
        if self.requests_out.remove(&request).is_none() {
            tracing::warn!(?request, "unsolicited block, discarding");
            return Ok(());
        }
        self.state.consecutive_timeouts = 0;

        let is_duplicate = if let Some(partial_piece) = self
            .torrent_ctx
            .picker
            .partial_pieces
            .read()
            .await
            .get(&request.piece_idx)
        {
            partial_piece.write().await.received_block(&request)
        } else {
            tracing::warn!(?request, "block received for a piece with no in-flight entry");
            return Ok(());
        };

        if is_duplicate {
            tracing::warn!(?request, "duplicate block");
            return self.make_requests(sink).await;
        }

        self.state.update(|state| state.throughput.down += block.data.len() as u64);

        let store = self.torrent_ctx.store.clone();
        let outcome = tokio::task::spawn_blocking(move || store.deposit_block(block))
            .await
            .expect("piece store deposit task panicked")?;

        match outcome {
            PieceOutcome::Verified => {
                // The store's commit broadcast drives HAVE and the picker
                // update uniformly across every session, this one included.
            }
            PieceOutcome::BadPiece => {
                if let Some(partial_piece) = self.torrent_ctx.picker.partial_pieces.read().await.get(&request.piece_idx) {
                    partial_piece.write().await.free_all_blocks();
                }
                self.torrent_ctx.picker.piece_picker.write().await.release_piece(request.piece_idx);
                self.torrent_ctx.torrent_tx.send(TorrentCommand::BadPiece {
                    idx: request.piece_idx,
                    peer: self.address,
                })?;
            }
            PieceOutcome::Incomplete | PieceOutcome::Duplicate => {}
        }

        self.make_requests(sink).await
    }

    async fn handle_request(&mut self, sink: &mut MessageSink, request: BlockRequest) -> Result<()> {

        if self.state.choked {
            tracing::trace!(?request, "ignoring request from a peer we haven't unchoked");
            return Ok(());
        }
        if !request.is_valid(&self.torrent_ctx.layout) {
            tracing::error!(?request, "invalid request");
            return Err(PeerError::InvalidMessage);
        }
        if !self.requests_in.insert(request) {
            tracing::warn!(?request, "duplicate request");
            return Ok(());
        }

        let store = self.torrent_ctx.store.clone();
        let data = tokio::task::spawn_blocking(move || store.read_block(request))
            .await
            .expect("piece store read task panicked")?;
        self.requests_in.remove(&request);

        self.state.update(|state| state.throughput.up += data.len() as u64);
        let _ = self.torrent_ctx.torrent_tx.send(TorrentCommand::Uploaded(data.len() as u64));
        self.send_message(sink, Message::Piece(Block {
            piece_idx: request.piece_idx,
            offset: request.offset,
            data: (*data).clone(),
        })).await
    }

    async fn handle_cancel(&mut self, request: BlockRequest) -> Result<()> {
        if !request.is_valid(&self.torrent_ctx.layout) {
            tracing::warn!(?request, "invalid cancel");
            return Err(PeerError::InvalidMessage);
        }
        self.requests_in.remove(&request);
        Ok(())
    }

    // A piece committed (ours or relayed from another peer's download):
    // advertise it with HAVE unless this peer already has it, and drop any
    // of our own outstanding requests for it since it's now redundant.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        if !self.bitfield.get(idx).map(|b| *b).unwrap_or(false) {
            self.send_message(sink, Message::Have { idx: idx as u32 }).await?;
        }

        let redundant: Vec<BlockRequest> = self.requests_out.keys().copied()
            .filter(|r| r.piece_idx == idx)
            .collect();
        for request in redundant {
            self.requests_out.remove(&request);
            sink.send(Message::Cancel(request)).await?;
        }

        Ok(())
    }

    // Tops up the request queue for this peer, unless we've become a pure
    // seeder, in which case no REQUEST is ever issued again.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.torrent_ctx.is_seed.load(Ordering::Relaxed) {
            return Ok(());
        }
        if self.state.peer_choking || !self.state.interested {
            return Ok(());
        }

        let current: HashSet<BlockRequest> = self.requests_out.keys().copied().collect();
        let requests = self
            .torrent_ctx
            .picker
            .pick_blocks(&current, self.torrent_ctx.config.max_requests_per_peer, &self.bitfield)
            .await;

        let now = Instant::now();
        for request in requests {
            tracing::trace!(?request, "send request");
            self.requests_out.insert(request, now);
            sink.send(Message::Request(request)).await?;
        }

        Ok(())
    }

    // Frees every block we had outstanding with this peer, e.g. after it
    // chokes us, so other peers can pick them up.
    async fn free_requests_out(&mut self) {
        tracing::debug!("freeing requested blocks after choke");
        let partial_pieces = self.torrent_ctx.picker.partial_pieces.read().await;
        for (request, _) in self.requests_out.drain() {
            if let Some(partial_piece) = partial_pieces.get(&request.piece_idx) {
                partial_piece.write().await.free_block(&request);
            }
        }
    }

    // Becoming interested is the only transition we ever announce; once a
    // torrent reaches seeder-only mode, INTERESTED is never sent.
    async fn update_interest(&mut self, sink: &mut MessageSink, interested: bool) -> Result<()> {
        if self.torrent_ctx.is_seed.load(Ordering::Relaxed) {
            return Ok(());
        }
        if !self.state.interested && interested {
            self.state.interested = true;
            self.send_message(sink, Message::Interested).await?;
        } else if self.state.interested && !interested {
            self.state.interested = false;
        }
        Ok(())
    }

    async fn tick(&mut self, sink: &mut MessageSink, time: Instant) -> Result<()> {

        if !self.state.interested && !self.state.peer_interested {
            if let Some(connect_time) = self.state.connect_time {
                if time.saturating_duration_since(connect_time) >= Duration::from_secs(30) {
                    tracing::debug!("disconnecting inactive peer");
                    return Err(PeerError::Timeout);
                }
            }
        }

        let timeout = self.torrent_ctx.config.request_timeout;
        let timed_out: Vec<BlockRequest> = self
            .requests_out
            .iter()
            .filter(|(_, sent)| time.saturating_duration_since(**sent) >= timeout)
            .map(|(request, _)| *request)
            .collect();

        if !timed_out.is_empty() {
            self.state.consecutive_timeouts += 1;
            for request in &timed_out {
                tracing::warn!(?request, "request timed out");
                self.requests_out.remove(request);
                // Best-effort: the session may be about to close regardless.
                let _ = sink.send(Message::Cancel(*request)).await;
                if let Some(partial_piece) = self.torrent_ctx.picker.partial_pieces.read().await.get(&request.piece_idx) {
                    partial_piece.write().await.free_block(request);
                }
            }

            if self.state.consecutive_timeouts >= self.torrent_ctx.config.max_consecutive_timeouts {
                tracing::warn!(count = self.state.consecutive_timeouts, "closing session after consecutive request timeouts");
                return Err(PeerError::Timeout);
            }
        }

        if self.state.changed {
            self.torrent_ctx.torrent_tx.send(TorrentCommand::PeerState {
                address: self.address,
                state: self.state,
            })?;
        }
        self.state.tick();

        Ok(())
    }
}
