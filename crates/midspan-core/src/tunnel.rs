//! Byte tunnel between client, origin, cache, and transforms.
//!
//! A tunnel is a directed graph of producers (byte sources) and consumers
//! (byte sinks). Every producer declares how chunked transfer encoding is
//! bridged at its edge; bytes are re-framed once, centrally, and fanned
//! out to however many consumers are attached. Transforms appear twice: as
//! a consumer of the upstream producer and as a downstream producer in
//! their own right.
//!
//! Like the rest of the core, the tunnel is a driver: events in
//! ([`Tunnel::handle_bytes`], [`Tunnel::handle_eos`], consumer
//! completions), actions out ([`TunnelAction`]), and per producer exactly
//! one final [`TunnelEvent`] of `{Done, ParseError, Precomplete,
//! ConsumerDetach}`.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::vc::VcKey;

/// How a producer's bytes are re-framed at the tunnel boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingAction {
    /// Incoming chunked, outgoing chunked: forward untouched
    PassthruChunkedContent,
    /// Neither side chunked: forward untouched
    PassthruDechunkedContent,
    /// Incoming length-framed, outgoing chunked: add chunking
    ChunkContent,
    /// Incoming chunked, outgoing length-framed: strip chunking
    DechunkContent,
}

/// Pick the chunking action for a producer edge.
///
/// `incoming_chunked`: the producer's bytes arrive chunked.
/// `outgoing_supports_chunked`: the consumers' protocol can carry chunked.
/// `body_length_known`: a Content-Length is available.
#[must_use]
pub fn select_chunking_action(
    incoming_chunked: bool,
    outgoing_supports_chunked: bool,
    body_length_known: bool,
) -> ChunkingAction {
    match (incoming_chunked, outgoing_supports_chunked) {
        (true, true) => ChunkingAction::PassthruChunkedContent,
        (true, false) => ChunkingAction::DechunkContent,
        (false, true) if !body_length_known => ChunkingAction::ChunkContent,
        (false, _) => ChunkingAction::PassthruDechunkedContent,
    }
}

/// Decide whether a dead client converts into a background fill.
///
/// The fill may only start when enabled, the content length is known, and
/// the consumed fraction has reached the threshold.
#[must_use]
pub fn should_background_fill(
    enabled: bool,
    bytes_consumed: u64,
    content_length: Option<u64>,
    threshold: f64,
) -> bool {
    if !enabled || !(0.0..=1.0).contains(&threshold) {
        return false;
    }
    match content_length {
        Some(total) if total > 0 => (bytes_consumed as f64) / (total as f64) >= threshold,
        _ => false,
    }
}

/// Incremental chunked-transfer decoder.
#[derive(Debug, Default)]
pub struct ChunkedDecoder {
    state: DecodeState,
    remaining: u64,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
enum DecodeState {
    #[default]
    Size,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    Trailer,
    TrailerLf,
    FinalLf,
    Complete,
}

/// A chunked-framing violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedParseError {
    /// Offset of the offending byte within the fed slice
    pub at: usize,
}

impl ChunkedDecoder {
    /// Fresh decoder at the start of a chunked body.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the terminating zero-chunk and trailers were consumed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == DecodeState::Complete
    }

    /// Feed `input`, appending decoded payload bytes to `out`.
    ///
    /// Returns the bytes consumed (all of `input` unless the body ended
    /// inside it).
    ///
    /// # Errors
    ///
    /// - `ChunkedParseError` on malformed framing
    pub fn feed(
        &mut self,
        input: &[u8],
        out: &mut BytesMut,
    ) -> Result<usize, ChunkedParseError> {
        let mut at = 0;
        while at < input.len() {
            let byte = input[at];
            match self.state {
                DecodeState::Size => match byte {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        let digit = u64::from(char::from(byte).to_digit(16).unwrap_or(0));
                        self.remaining = self.remaining.checked_mul(16).ok_or(
                            ChunkedParseError { at },
                        )? + digit;
                        at += 1;
                    }
                    b'\r' => {
                        self.state = DecodeState::SizeLf;
                        at += 1;
                    }
                    b';' => {
                        self.state = DecodeState::Extension;
                        at += 1;
                    }
                    _ => return Err(ChunkedParseError { at }),
                },
                DecodeState::Extension => {
                    // Chunk extensions are skipped to the CR
                    if byte == b'\r' {
                        self.state = DecodeState::SizeLf;
                    }
                    at += 1;
                }
                DecodeState::SizeLf => {
                    if byte != b'\n' {
                        return Err(ChunkedParseError { at });
                    }
                    at += 1;
                    self.state = if self.remaining == 0 {
                        DecodeState::TrailerStart
                    } else {
                        DecodeState::Data
                    };
                }
                DecodeState::Data => {
                    let take = (input.len() - at).min(self.remaining as usize);
                    out.put_slice(&input[at..at + take]);
                    at += take;
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.state = DecodeState::DataCr;
                    }
                }
                DecodeState::DataCr => {
                    if byte != b'\r' {
                        return Err(ChunkedParseError { at });
                    }
                    at += 1;
                    self.state = DecodeState::DataLf;
                }
                DecodeState::DataLf => {
                    if byte != b'\n' {
                        return Err(ChunkedParseError { at });
                    }
                    at += 1;
                    self.state = DecodeState::Size;
                }
                DecodeState::TrailerStart => {
                    if byte == b'\r' {
                        self.state = DecodeState::FinalLf;
                    } else {
                        self.state = DecodeState::Trailer;
                    }
                    at += 1;
                }
                DecodeState::Trailer => {
                    if byte == b'\r' {
                        self.state = DecodeState::TrailerLf;
                    }
                    at += 1;
                }
                DecodeState::TrailerLf => {
                    if byte != b'\n' {
                        return Err(ChunkedParseError { at });
                    }
                    at += 1;
                    self.state = DecodeState::TrailerStart;
                }
                DecodeState::FinalLf => {
                    if byte != b'\n' {
                        return Err(ChunkedParseError { at });
                    }
                    at += 1;
                    self.state = DecodeState::Complete;
                    return Ok(at);
                }
                DecodeState::Complete => return Ok(at),
            }
        }
        Ok(at)
    }
}

/// Chunked-transfer encoder.
#[derive(Debug)]
pub struct ChunkedEncoder {
    chunk_size: usize,
}

impl ChunkedEncoder {
    /// Encoder emitting chunks of at most `chunk_size` payload bytes.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size: chunk_size.max(1) }
    }

    /// Append `data` to `out` in chunked framing.
    pub fn encode(&self, data: &[u8], out: &mut BytesMut) {
        for piece in data.chunks(self.chunk_size) {
            out.put_slice(format!("{:x}\r\n", piece.len()).as_bytes());
            out.put_slice(piece);
            out.put_slice(b"\r\n");
        }
    }

    /// Append the terminating zero chunk.
    pub fn finish(&self, out: &mut BytesMut) {
        out.put_slice(b"0\r\n\r\n");
    }
}

/// Final event the tunnel delivers to the owning machine, once per
/// producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Producer and all its consumers finished cleanly
    Done {
        /// Producer key
        producer: VcKey,
    },
    /// Chunked framing from the producer was malformed
    ParseError {
        /// Producer key
        producer: VcKey,
    },
    /// Producer hit EOS before its declared length
    Precomplete {
        /// Producer key
        producer: VcKey,
        /// Bytes actually seen
        bytes_seen: u64,
        /// Declared content length
        expected: u64,
    },
    /// Every consumer died and no background fill applies
    ConsumerDetach {
        /// Producer key
        producer: VcKey,
    },
}

/// I/O the runtime performs on the tunnel's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelAction {
    /// Write `data` to the consumer endpoint
    WriteTo {
        /// Consumer key
        consumer: VcKey,
        /// Bytes to write
        data: Bytes,
    },
    /// Close the consumer endpoint after pending writes drain
    CloseConsumer {
        /// Consumer key
        consumer: VcKey,
    },
    /// Stop reading from the producer endpoint
    AbortProducer {
        /// Producer key
        producer: VcKey,
    },
}

/// What role a consumer plays, for background-fill decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerRole {
    /// The client connection
    Client,
    /// The origin connection (request bodies)
    Origin,
    /// A cache write
    CacheWrite,
    /// A transform input
    Transform,
}

#[derive(Debug)]
struct Producer {
    key: VcKey,
    action: ChunkingAction,
    decoder: ChunkedDecoder,
    encoder: ChunkedEncoder,
    content_length: Option<u64>,
    bytes_in: u64,
    payload_bytes: u64,
    finished: bool,
    consumers: Vec<usize>,
}

#[derive(Debug)]
struct Consumer {
    key: VcKey,
    role: ConsumerRole,
    alive: bool,
    bytes_written: u64,
}

/// The tunnel.
#[derive(Debug, Default)]
pub struct Tunnel {
    producers: Vec<Producer>,
    consumers: Vec<Consumer>,
    background_fill_enabled: bool,
    background_fill_threshold: f64,
    running: bool,
}

impl Tunnel {
    /// Tunnel with background fill configured.
    #[must_use]
    pub fn new(background_fill_enabled: bool, background_fill_threshold: f64) -> Self {
        Self {
            background_fill_enabled,
            background_fill_threshold,
            ..Self::default()
        }
    }

    /// Register a producer. `content_length` is the declared body size on
    /// the incoming side (after dechunking, when dechunking).
    pub fn add_producer(
        &mut self,
        key: VcKey,
        action: ChunkingAction,
        content_length: Option<u64>,
        chunk_size: usize,
    ) {
        self.producers.push(Producer {
            key,
            action,
            decoder: ChunkedDecoder::new(),
            encoder: ChunkedEncoder::new(chunk_size),
            content_length,
            bytes_in: 0,
            payload_bytes: 0,
            finished: false,
            consumers: Vec::new(),
        });
    }

    /// Attach a consumer to `producer`.
    pub fn add_consumer(&mut self, producer: VcKey, key: VcKey, role: ConsumerRole) {
        let index = self.consumers.len();
        self.consumers.push(Consumer { key, role, alive: true, bytes_written: 0 });
        if let Some(p) = self.producers.iter_mut().find(|p| p.key == producer) {
            p.consumers.push(index);
        }
    }

    /// Splice a transform into the graph: it consumes `upstream` and
    /// produces on its own key, so its output can be fanned out like any
    /// other producer. The transform's bytes come back through
    /// [`Self::handle_bytes`] under `transform`.
    pub fn chain_transform(&mut self, upstream: VcKey, transform: VcKey, chunk_size: usize) {
        self.add_consumer(upstream, transform, ConsumerRole::Transform);
        // Transform output is already payload bytes in both directions
        self.add_producer(
            transform,
            ChunkingAction::PassthruDechunkedContent,
            None,
            chunk_size,
        );
    }

    /// Start the tunnel.
    pub fn tunnel_run(&mut self) {
        self.running = true;
    }

    /// True once started and not yet fully finished.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.running && self.producers.iter().any(|p| !p.finished)
    }

    /// Bytes a producer's consumers have been handed so far.
    #[must_use]
    pub fn bytes_consumed(&self, producer: VcKey) -> u64 {
        self.producers
            .iter()
            .find(|p| p.key == producer)
            .map_or(0, |p| p.payload_bytes)
    }

    /// Feed bytes read from `producer`.
    pub fn handle_bytes(
        &mut self,
        producer: VcKey,
        data: &[u8],
        actions: &mut Vec<TunnelAction>,
        events: &mut Vec<TunnelEvent>,
    ) {
        let Some(p_index) = self.producers.iter().position(|p| p.key == producer) else {
            debug!(producer, "bytes for unknown producer");
            return;
        };
        if self.producers[p_index].finished {
            return;
        }
        self.producers[p_index].bytes_in += data.len() as u64;

        let out = {
            let p = &mut self.producers[p_index];
            match p.action {
                ChunkingAction::PassthruChunkedContent
                | ChunkingAction::PassthruDechunkedContent => {
                    p.payload_bytes += data.len() as u64;
                    Bytes::copy_from_slice(data)
                }
                ChunkingAction::DechunkContent => {
                    let mut decoded = BytesMut::new();
                    match p.decoder.feed(data, &mut decoded) {
                        Ok(_) => {
                            p.payload_bytes += decoded.len() as u64;
                            decoded.freeze()
                        }
                        Err(err) => {
                            debug!(producer, at = err.at, "chunked parse error");
                            p.finished = true;
                            events.push(TunnelEvent::ParseError { producer });
                            self.kill_consumers_of(p_index, actions);
                            return;
                        }
                    }
                }
                ChunkingAction::ChunkContent => {
                    let mut encoded = BytesMut::new();
                    p.encoder.encode(data, &mut encoded);
                    p.payload_bytes += data.len() as u64;
                    encoded.freeze()
                }
            }
        };

        if out.is_empty() {
            return;
        }
        let consumer_indexes = self.producers[p_index].consumers.clone();
        for c_index in consumer_indexes {
            let consumer = &mut self.consumers[c_index];
            if consumer.alive {
                consumer.bytes_written += out.len() as u64;
                actions.push(TunnelAction::WriteTo { consumer: consumer.key, data: out.clone() });
            }
        }
    }

    /// Producer reached end of stream.
    pub fn handle_eos(
        &mut self,
        producer: VcKey,
        actions: &mut Vec<TunnelAction>,
        events: &mut Vec<TunnelEvent>,
    ) {
        let Some(p_index) = self.producers.iter().position(|p| p.key == producer) else {
            return;
        };
        if self.producers[p_index].finished {
            return;
        }

        // Dechunking that never saw the zero chunk is a framing error
        if self.producers[p_index].action == ChunkingAction::DechunkContent
            && !self.producers[p_index].decoder.is_complete()
        {
            self.producers[p_index].finished = true;
            events.push(TunnelEvent::ParseError { producer });
            self.kill_consumers_of(p_index, actions);
            return;
        }

        // Close the chunked framing toward re-chunked consumers
        if self.producers[p_index].action == ChunkingAction::ChunkContent {
            let mut tail = BytesMut::new();
            self.producers[p_index].encoder.finish(&mut tail);
            let tail = tail.freeze();
            let consumer_indexes = self.producers[p_index].consumers.clone();
            for c_index in consumer_indexes {
                let consumer = &mut self.consumers[c_index];
                if consumer.alive {
                    consumer.bytes_written += tail.len() as u64;
                    actions
                        .push(TunnelAction::WriteTo { consumer: consumer.key, data: tail.clone() });
                }
            }
        }

        let p = &mut self.producers[p_index];
        p.finished = true;

        // EOS before the declared length is upstream truncation
        if let Some(expected) = p.content_length
            && p.payload_bytes < expected
        {
            let bytes_seen = p.payload_bytes;
            events.push(TunnelEvent::Precomplete { producer, bytes_seen, expected });
        } else {
            events.push(TunnelEvent::Done { producer });
        }

        let consumer_indexes = p.consumers.clone();
        for c_index in consumer_indexes {
            let consumer = &self.consumers[c_index];
            if consumer.alive {
                actions.push(TunnelAction::CloseConsumer { consumer: consumer.key });
            }
        }
    }

    /// A consumer endpoint died (client abort, cache error).
    pub fn handle_consumer_death(
        &mut self,
        consumer: VcKey,
        actions: &mut Vec<TunnelAction>,
        events: &mut Vec<TunnelEvent>,
    ) {
        let Some(c_index) = self.consumers.iter().position(|c| c.key == consumer) else {
            return;
        };
        let was_client = self.consumers[c_index].role == ConsumerRole::Client;
        self.consumers[c_index].alive = false;

        let producer_indexes: Vec<usize> = self
            .producers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.consumers.contains(&c_index) && !p.finished)
            .map(|(i, _)| i)
            .collect();

        for p_index in producer_indexes {
            let survivors = self.producers[p_index]
                .consumers
                .iter()
                .filter(|&&c| self.consumers[c].alive)
                .count();

            if survivors == 0 {
                let key = self.producers[p_index].key;
                self.producers[p_index].finished = true;
                events.push(TunnelEvent::ConsumerDetach { producer: key });
                actions.push(TunnelAction::AbortProducer { producer: key });
                continue;
            }

            // A cache write may keep the producer alive past a client
            // abort, but only past the configured threshold
            if was_client {
                let keeps_cache_write = self.producers[p_index]
                    .consumers
                    .iter()
                    .any(|&c| self.consumers[c].alive && self.consumers[c].role == ConsumerRole::CacheWrite);
                let fill = keeps_cache_write
                    && should_background_fill(
                        self.background_fill_enabled,
                        self.producers[p_index].payload_bytes,
                        self.producers[p_index].content_length,
                        self.background_fill_threshold,
                    );
                if !fill && keeps_cache_write {
                    // Not worth finishing; tear the whole producer down
                    let key = self.producers[p_index].key;
                    self.producers[p_index].finished = true;
                    events.push(TunnelEvent::ConsumerDetach { producer: key });
                    actions.push(TunnelAction::AbortProducer { producer: key });
                    self.kill_consumers_of(p_index, actions);
                } else {
                    debug!(
                        producer = self.producers[p_index].key,
                        "client detached, continuing background fill"
                    );
                }
            }
        }
    }

    fn kill_consumers_of(&mut self, p_index: usize, actions: &mut Vec<TunnelAction>) {
        let consumer_indexes = self.producers[p_index].consumers.clone();
        for c_index in consumer_indexes {
            let consumer = &mut self.consumers[c_index];
            if consumer.alive {
                consumer.alive = false;
                actions.push(TunnelAction::CloseConsumer { consumer: consumer.key });
            }
        }
    }
}
