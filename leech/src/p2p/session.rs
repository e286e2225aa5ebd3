use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
    time,
};
use tokio_util::codec::Framed;
use crate::{
    block::{block_len, num_blocks, BlockData, BlockInfo},
    piece::PieceBuf,
    torrent::{CommandToTorrent, TorrentContext},
    Bitfield, BLOCK_SIZE, MAX_INFLIGHT,
};
use super::{handshake::*, message::*, *};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// A peer that sends no frame at all for this long is dropped.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

// The upload budget is replenished once per window.
const ALLOWANCE_WINDOW: Duration = Duration::from_secs(10);

// Cap on queued inbound requests; a peer flooding past this is dropped.
const MAX_REQUEST_QUEUE: usize = 500;

type MessageSink<T> = SplitSink<Framed<T, MessageCodec>, Message>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ConnState {
    Connecting,
    Handshaking,
    // Directly after the handshake, where bitfields are exchanged.
    Introducing,
    Connected,
}

// Choke and interest flags for both directions, wire-protocol defaults.
#[derive(Debug, Clone, Copy)]
struct SessionState {

    conn_state: ConnState,

    // Whether we are answering the peer's requests.
    choked: bool,

    // Whether we want pieces from the peer.
    interested: bool,

    // Whether the peer is answering our requests.
    peer_choking: bool,

    // Whether the peer wants our pieces.
    peer_interested: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Connecting,
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

#[derive(Debug)]
pub struct PeerSession {

    // The peer's IP address.
    address: SocketAddr,

    // Read-only state shared with the whole torrent.
    ctx: Arc<TorrentContext>,

    // Commands from the coordinator.
    peer_rx: PeerRx,

    state: SessionState,

    // Snapshot of the coordinator's verified pieces, kept current through
    // local completions and coordinator broadcasts.
    i_have: Bitfield,

    // Pieces the remote has announced.
    peer_has: Bitfield,

    // peer_has \ i_have: candidates to request from this peer. A piece stays
    // here until it is verified somewhere.
    want: Bitfield,

    // Pieces whose block requests this session has already queued, so the
    // random picker doesn't schedule the same piece twice.
    pending: HashSet<usize>,

    // Outbound requests awaiting wire send, FIFO.
    out_queue: VecDeque<BlockInfo>,

    // Inbound block requests to serve, FIFO.
    in_queue: VecDeque<BlockInfo>,

    // Requests sent to the peer but not yet answered, in send order.
    in_flight: VecDeque<BlockInfo>,

    // Blocks of in-progress pieces, keyed by piece index.
    partial: HashMap<usize, PieceBuf>,

    // Bytes of upload budget left in the current window; negative is debt
    // carried into the next window.
    upload_allowance: i64,

    last_seen: Instant,

    rng: StdRng,

}

impl PeerSession {

    pub fn new(
        address: SocketAddr,
        ctx: Arc<TorrentContext>,
        i_have: Bitfield,
    ) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let num_pieces = ctx.store.info().num_pieces;
        let upload_allowance = (ctx.upload_bps * ALLOWANCE_WINDOW.as_secs()) as i64;

        (
            PeerSession {
                address,
                ctx,
                peer_rx,
                state: SessionState::default(),
                i_have,
                peer_has: Bitfield::repeat(false, num_pieces),
                want: Bitfield::repeat(false, num_pieces),
                pending: HashSet::new(),
                out_queue: VecDeque::new(),
                in_queue: VecDeque::new(),
                in_flight: VecDeque::new(),
                partial: HashMap::new(),
                upload_allowance,
                last_seen: Instant::now(),
                rng: StdRng::from_entropy(),
            },
            peer_tx,
        )
    }

    // Entry point for the session task. Whatever way the session ends, the
    // coordinator observes it as a peer exit.
    #[tracing::instrument(name = "peer", skip(self, inbound_stream), fields(address = %self.address))]
    pub async fn start(&mut self, inbound_stream: Option<TcpStream>) {
        match self.run_tcp(inbound_stream).await {
            Ok(()) => tracing::debug!("session closed"),
            Err(e) => tracing::info!("session ended: {}", e),
        }
        self.ctx.torrent_tx
            .send(CommandToTorrent::PeerDisconnected { address: self.address })
            .ok();
    }

    async fn run_tcp(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        let inbound = inbound_stream.is_some();
        let stream = match inbound_stream {
            Some(stream) => stream,
            None => {
                self.state.conn_state = ConnState::Connecting;
                time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.address))
                    .await
                    .map_err(|_| PeerError::Timeout)??
            }
        };

        let mut socket = Framed::new(stream, HandshakeCodec);
        let peer_id = self.exchange_handshake(&mut socket, inbound).await?;
        self.ctx.torrent_tx.send(CommandToTorrent::PeerConnected {
            address: self.address,
            id: peer_id,
        })?;

        // Keep any bytes the peer pipelined behind its handshake.
        let socket = socket.map_codec(|_| MessageCodec);
        self.run(socket).await
    }

    async fn exchange_handshake<T>(
        &mut self,
        socket: &mut Framed<T, HandshakeCodec>,
        inbound: bool,
    ) -> Result<ID>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        self.state.conn_state = ConnState::Handshaking;

        if !inbound {
            socket.send(Handshake::new(self.ctx.info_hash, self.ctx.client_id)).await?;
        }

        match socket.next().await {
            Some(Ok(handshake)) => {
                if handshake.info_hash != self.ctx.info_hash {
                    return Err(PeerError::IncorrectInfoHash);
                }
                if inbound {
                    socket.send(Handshake::new(self.ctx.info_hash, self.ctx.client_id)).await?;
                }
                tracing::debug!("handshake complete: {:?}", handshake);
                Ok(handshake.peer_id)
            }
            Some(Err(e)) => Err(e),
            None => Err(PeerError::NoHandshake),
        }
    }

    pub(crate) async fn run<T>(&mut self, socket: Framed<T, MessageCodec>) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        self.state.conn_state = ConnState::Introducing;
        self.last_seen = Instant::now();
        let (mut sink, mut stream) = socket.split();

        // Introduce ourselves if there is anything to share.
        if self.i_have.any() {
            sink.send(Message::Bitfield(self.i_have.clone())).await?;
        }

        // Keep-alive cadence is jittered so sessions don't tick in step.
        let keepalive_period = Duration::from_secs(self.rng.gen_range(5..=15));
        let mut keepalive = time::interval_at(
            time::Instant::now() + keepalive_period,
            keepalive_period,
        );
        let mut allowance = time::interval_at(
            time::Instant::now() + ALLOWANCE_WINDOW,
            ALLOWANCE_WINDOW,
        );

        loop { tokio::select! {

            // Frame from the peer.
            msg = stream.next() => match msg {
                Some(Ok(msg)) => {
                    self.last_seen = Instant::now();
                    self.handle_msg(&mut sink, msg).await?;
                }
                Some(Err(e)) => return Err(e),
                None => {
                    tracing::debug!("peer closed connection");
                    return Ok(());
                }
            },

            // Command from the coordinator.
            Some(cmd) = self.peer_rx.recv() => match cmd {
                PeerCommand::HavePiece(idx) => self.handle_local_have(&mut sink, idx).await?,
                PeerCommand::Shutdown => {
                    tracing::debug!("session shutdown");
                    return Ok(());
                }
            },

            _ = keepalive.tick() => sink.send(Message::KeepAlive).await?,

            _ = allowance.tick() => {
                if self.last_seen.elapsed() >= INACTIVITY_TIMEOUT {
                    tracing::debug!("disconnecting silent peer");
                    return Err(PeerError::Timeout);
                }
                // Unused budget doesn't accumulate; overshoot carries over as
                // debt.
                self.upload_allowance = (self.ctx.upload_bps * ALLOWANCE_WINDOW.as_secs()) as i64
                    + self.upload_allowance.min(0);
                self.drive(&mut sink).await?;
            }
        }}
    }

    async fn handle_msg<T>(&mut self, sink: &mut MessageSink<T>, msg: Message) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::trace!("read: {}", msg);

        match msg {

            // A bitfield is only valid directly after the handshake.
            Message::Bitfield(bitfield) => {
                if self.state.conn_state != ConnState::Introducing {
                    return Err(PeerError::UnexpectedBitfield);
                }
                self.handle_bitfield(bitfield)?;
            }

            Message::KeepAlive => {}

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.peer_choking = true;
                    self.requeue_in_flight();
                }
            }

            Message::Unchoke => self.state.peer_choking = false,

            Message::Interested => self.state.peer_interested = true,

            Message::NotInterested => self.state.peer_interested = false,

            Message::Have { idx } => self.handle_have(idx)?,

            Message::Request(request) => self.handle_request(request)?,

            Message::Cancel(request) => {
                // Advisory: drop the queued reply if we haven't sent it yet.
                self.in_queue.retain(|r| *r != request);
            }

            Message::Block(block) => self.handle_block(block)?,
        }

        if self.state.conn_state == ConnState::Introducing {
            self.state.conn_state = ConnState::Connected;
        }

        self.drive(sink).await
    }

    fn handle_bitfield(&mut self, mut bitfield: Bitfield) -> Result<()> {
        let num_pieces = self.ctx.store.info().num_pieces;
        if bitfield.len() < num_pieces {
            return Err(PeerError::InvalidMessage);
        }
        // Trailing pad bits up to the next byte boundary.
        bitfield.resize(num_pieces, false);
        tracing::debug!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);
        self.want = andnot(&bitfield, &self.i_have);
        self.peer_has = bitfield;
        Ok(())
    }

    fn handle_have(&mut self, idx: u32) -> Result<()> {
        let idx = idx as usize;
        if idx >= self.ctx.store.info().num_pieces {
            return Err(PeerError::InvalidMessage);
        }
        if self.peer_has[idx] {
            return Ok(());
        }
        self.peer_has.set(idx, true);
        if !self.i_have[idx] {
            self.want.set(idx, true);
        }
        Ok(())
    }

    fn handle_request(&mut self, request: BlockInfo) -> Result<()> {
        // Requests sent while we choke the peer are dropped silently.
        if self.state.choked {
            return Ok(());
        }
        if !request.is_valid(self.ctx.store.info()) || !self.i_have[request.piece_idx] {
            tracing::warn!("invalid request: {:?}", request);
            return Err(PeerError::InvalidMessage);
        }
        if self.in_queue.len() >= MAX_REQUEST_QUEUE {
            return Err(PeerError::RequestOverflow);
        }
        self.in_queue.push_back(request);
        Ok(())
    }

    fn handle_block(&mut self, block: BlockData) -> Result<()> {

        let info = BlockInfo::of(&block);
        if !info.is_valid(self.ctx.store.info()) {
            return Err(PeerError::InvalidMessage);
        }

        let was_in_flight = match self.in_flight.iter().position(|r| *r == info) {
            Some(pos) => {
                self.in_flight.remove(pos);
                true
            }
            None => false,
        };

        // Cancels are advisory: the remote may have put this block on the
        // wire before our cancel reached it. A block for a piece that has
        // since completed is dropped without complaint.
        if self.i_have[info.piece_idx] {
            return Ok(());
        }
        if !was_in_flight {
            // A block for a piece never scheduled here was never requested.
            if !self.pending.contains(&info.piece_idx) {
                tracing::warn!("unsolicited block: {:?}", info);
                return Err(PeerError::InvalidMessage);
            }
            // Late arrival after a choke; still usable, but drop the queued
            // duplicate request.
            self.out_queue.retain(|r| *r != info);
        }

        self.ctx.downloaded.fetch_add(block.data.len() as u64, Ordering::Relaxed);

        let piece_len = self.ctx.store.info().piece_length(info.piece_idx);
        let hash = self.ctx.store.piece_sha(info.piece_idx);
        let buf = self.partial
            .entry(info.piece_idx)
            .or_insert_with(|| PieceBuf::new(hash, piece_len));
        if !buf.add_block(&block) {
            tracing::warn!("duplicate block: {:?}", info);
            return Ok(());
        }

        if buf.is_complete() {
            let buf = self.partial.remove(&info.piece_idx).expect("buf just filled");
            self.finish_piece(info.piece_idx, buf)?;
        }
        Ok(())
    }

    // Verify and persist a fully assembled piece.
    fn finish_piece(&mut self, idx: usize, buf: PieceBuf) -> Result<()> {

        self.pending.remove(&idx);

        if !buf.verify_hash() {
            // The piece stays in want and goes back to candidacy.
            tracing::warn!("piece {} failed hash verification", idx);
            return Ok(());
        }

        if let Err(e) = self.ctx.store.write_piece(idx, buf.data()) {
            // Data loss risk: the whole torrent shuts down.
            self.ctx.torrent_tx
                .send(CommandToTorrent::StorageFailure(e.to_string()))
                .ok();
            return Err(e.into());
        }

        self.i_have.set(idx, true);
        self.want.set(idx, false);
        tracing::debug!("piece {} downloaded and verified", idx);
        self.ctx.torrent_tx.send(CommandToTorrent::PieceDownloaded { idx })?;
        Ok(())
    }

    // Choked: everything on the wire is presumed lost. Re-injecting LIFO at
    // the front leaves them at the head of out_queue in original send order,
    // ahead of everything already queued.
    fn requeue_in_flight(&mut self) {
        tracing::debug!("requeueing {} in-flight requests", self.in_flight.len());
        while let Some(request) = self.in_flight.pop_back() {
            self.out_queue.push_front(request);
        }
    }

    // A piece completed somewhere in the torrent.
    async fn handle_local_have<T>(&mut self, sink: &mut MessageSink<T>, idx: usize) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        self.i_have.set(idx, true);

        if self.want[idx] {
            self.want.set(idx, false);
            self.pending.remove(&idx);
            self.partial.remove(&idx);
            self.out_queue.retain(|r| r.piece_idx != idx);

            // Cancel whatever this session still has on the wire for it.
            let stale: Vec<BlockInfo> = self.in_flight
                .iter()
                .filter(|r| r.piece_idx == idx)
                .copied()
                .collect();
            self.in_flight.retain(|r| r.piece_idx != idx);
            for request in stale {
                sink.send(Message::Cancel(request)).await?;
            }
        }

        sink.send(Message::Have { idx: idx as u32 }).await?;
        self.drive(sink).await
    }

    // The outgoing work loop, run after every inbound event and timer tick.
    async fn drive<T>(&mut self, sink: &mut MessageSink<T>) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        // Top up the request queue, one random piece at a time. Random
        // selection gives the swarm piece diversity without coordination.
        while self.out_queue.len() + self.in_flight.len() < MAX_INFLIGHT {
            let Some(piece_idx) = self.pick_piece() else { break };
            let piece_len = self.ctx.store.info().piece_length(piece_idx);
            for block_idx in 0..num_blocks(piece_len) {
                self.out_queue.push_back(BlockInfo {
                    piece_idx,
                    offset: block_idx * BLOCK_SIZE,
                    len: block_len(piece_len, block_idx),
                });
            }
            self.pending.insert(piece_idx);
            tracing::trace!("scheduled piece {}", piece_idx);
        }

        // Announce interest as soon as work is queued, so a strict remote
        // will consider unchoking us.
        if !self.state.interested && !self.out_queue.is_empty() {
            self.state.interested = true;
            sink.send(Message::Interested).await?;
        }

        // Put requests on the wire.
        while !self.state.peer_choking && self.in_flight.len() < MAX_INFLIGHT {
            let Some(request) = self.out_queue.pop_front() else { break };
            self.in_flight.push_back(request);
            sink.send(Message::Request(request)).await?;
        }

        // Nothing left to ask this peer for.
        if self.state.interested && self.in_flight.is_empty() && self.out_queue.is_empty() {
            self.state.interested = false;
            sink.send(Message::NotInterested).await?;
        }

        // Unchoke whenever there is budget to serve with.
        if self.state.choked && self.upload_allowance > 0 {
            self.state.choked = false;
            sink.send(Message::Unchoke).await?;
        }

        // Serve queued requests until the budget runs out.
        while !self.state.choked && self.state.peer_interested && self.upload_allowance > 0 {
            let Some(request) = self.in_queue.pop_front() else { break };
            let data = self.ctx.store.read_block(&request)?;
            self.upload_allowance -= data.len() as i64;
            self.ctx.uploaded.fetch_add(data.len() as u64, Ordering::Relaxed);
            sink.send(Message::Block(BlockData {
                piece_idx: request.piece_idx,
                offset: request.offset,
                data,
            })).await?;
        }
        if self.upload_allowance <= 0 && !self.state.choked {
            self.state.choked = true;
            sink.send(Message::Choke).await?;
        }

        Ok(())
    }

    // Uniform choice over pieces the peer has, we lack, and this session has
    // not already scheduled.
    fn pick_piece(&mut self) -> Option<usize> {
        let candidates: Vec<usize> = self.want
            .iter_ones()
            .filter(|idx| !self.pending.contains(idx))
            .collect();
        if candidates.is_empty() {
            None
        } else {
            Some(candidates[self.rng.gen_range(0..candidates.len())])
        }
    }
}

// A \ B over equal-width bitfields.
fn andnot(a: &Bitfield, b: &Bitfield) -> Bitfield {
    let mut out = a.clone();
    for idx in b.iter_ones() {
        out.set(idx, false);
    }
    out
}
