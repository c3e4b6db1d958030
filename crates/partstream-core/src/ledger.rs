//! The ledger: per-session reassembly state.
//!
//! Every session owns a slot with two independently locked parts:
//! the branch/buffer state and the [`CompletionCounter`]. The top-level map is
//! only locked long enough to look a slot up, insert it or remove it, so
//! sessions never contend with each other.
//!
//! Within a session, pieces are applied strictly in part order. A piece that
//! arrives early is parked in the session's buffer and applied by
//! [`Store::register_buffer`] once the gap is filled.
//!
//! # Branches
//!
//! At any time a session has at most one *confirmed* branch (the section
//! being read) and at most one *speculative* branch (bytes that may be the
//! start of `CRLF ++ delimiter`). The speculative branch is resolved by the
//! next bytes of the stream: a full marker promotes it (the confirmed section
//! ends and a new one starts), anything else turns its bytes back into
//! ordinary section data.
//!
//! A section that ended is kept as the *closing* record until the two bytes
//! after the next delimiter are known. `--` means the upload is over and the
//! closing record is emitted with [`PostAction::Finish`]; anything else means
//! another field follows and it is emitted with [`PostAction::Close`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::boundary::{Boundary, MarkerMatch, match_marker};
use crate::config::ReassemblyConfig;
use crate::counter::{CompletionCounter, Order};
use crate::envelope::{EnvelopeKind, OutputEnvelope, PostAction, PreAction, StreamKey};
use crate::error::{Condition, ReassemblyError};
use crate::header::{Disposition, HeaderStatus};
use crate::piece::{BeginState, DataPiece, EndState, PartId, PieceUnit, SessionId, SubPiece};

/// Which hypothesis a branch represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BranchKind {
    /// No delimiter here: the bytes belong to the current section.
    Confirmed,
    /// The bytes may be the start of a delimiter.
    Speculative,
}

/// Identifies a live branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BranchKey {
    pub session: SessionId,
    pub part: PartId,
    pub kind: BranchKind,
}

/// What a registration did with its piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// The piece was applied and nothing is left waiting.
    Applied,
    /// The piece is ahead of the expected part and was parked.
    Buffered,
    /// Candidate delimiter bytes are pending resolution.
    AwaitingBoundary,
    /// The current field header has not been completed yet.
    HeaderIncomplete,
    /// The upload ended; the `Finish` envelope has been produced.
    SessionFinished,
    /// The piece was dropped.
    Discarded(DiscardReason),
}

/// Why a piece was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiscardReason {
    /// Its part was already consumed.
    StalePart,
    /// An identical piece is already buffered.
    DuplicatePart,
    /// The session already finished.
    SessionFinished,
}

/// The result of registering one piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// The piece's session.
    pub session: SessionId,
    /// The piece's part.
    pub part: PartId,
    /// Envelopes ready for the transport, in stream order.
    pub envelopes: Vec<OutputEnvelope>,
    pub outcome: Outcome,
    /// Recoverable problems noticed while applying the piece.
    pub conditions: Vec<Condition>,
    /// Counter position of this piece; `Unordered` for buffered pieces.
    pub order: Order,
    /// Whether the session's state was purged after this piece.
    pub purged: bool,
}

impl Registration {
    fn new(session: SessionId, part: PartId, outcome: Outcome) -> Self {
        Self {
            session,
            part,
            envelopes: Vec::new(),
            outcome,
            conditions: Vec::new(),
            order: Order::Unordered,
            purged: false,
        }
    }
}

/// Point-in-time view of one session, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub next_part: PartId,
    pub branches: Vec<BranchKey>,
    pub buffered: usize,
    pub has_buffer: bool,
    pub counter: CompletionCounter,
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Body,
    Discard,
}

/// Reconstruction state of one section.
#[derive(Debug, Clone)]
struct BranchRecord {
    disposition: Disposition,
    segment_start_part: PartId,
    end: EndState,
    phase: Phase,
    pending: Vec<u8>,
    opened: bool,
    emitted_bytes: usize,
}

impl BranchRecord {
    fn new(segment_start_part: PartId) -> Self {
        Self {
            disposition: Disposition::new(),
            segment_start_part,
            end: EndState::No,
            phase: Phase::Header,
            pending: Vec::new(),
            opened: false,
            emitted_bytes: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct SpeculativeBranch {
    part: PartId,
    bytes: Vec<u8>,
}

/// Out-of-order pieces, sorted by part.
#[derive(Debug, Default)]
struct Buffer {
    pieces: Vec<DataPiece>,
}

impl Buffer {
    fn insert(&mut self, piece: DataPiece) -> bool {
        if self.pieces.contains(&piece) {
            return false;
        }
        let idx = self.pieces.partition_point(|p| p.part() <= piece.part());
        self.pieces.insert(idx, piece);
        true
    }

    fn front_part(&self) -> Option<PartId> {
        self.pieces.first().map(DataPiece::part)
    }

    fn pop_front(&mut self) -> Option<DataPiece> {
        if self.pieces.is_empty() {
            None
        } else {
            Some(self.pieces.remove(0))
        }
    }

    fn len(&self) -> usize {
        self.pieces.len()
    }

    fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

/// Action bookkeeping shared by all sections of a session.
#[derive(Debug, Default)]
struct Emission {
    emitted_any: bool,
    stop_last: bool,
    finish_sent: bool,
}

impl Emission {
    fn emit(
        &mut self,
        session: SessionId,
        record: &mut BranchRecord,
        body: Vec<u8>,
        post: PostAction,
        out: &mut Vec<OutputEnvelope>,
    ) {
        let first = !record.opened;
        let pre = if !first {
            PreAction::Continue
        } else if !self.emitted_any {
            PreAction::Start
        } else if std::mem::take(&mut self.stop_last) {
            PreAction::StopLast
        } else {
            PreAction::Open
        };
        let kind = if first && post.closes_stream() {
            EnvelopeKind::Unary
        } else {
            EnvelopeKind::StreamChunk
        };

        record.opened = true;
        record.emitted_bytes += body.len();
        self.emitted_any = true;
        self.finish_sent |= post == PostAction::Finish;

        out.push(OutputEnvelope {
            kind,
            stream_key: StreamKey {
                session,
                part: record.segment_start_part,
            },
            form_name: record.disposition.form_name().to_string(),
            file_name: record.disposition.file_name().to_string(),
            content_type: record.disposition.content_type().map(str::to_string),
            pre_action: pre,
            post_action: post,
            body,
        });
    }

    /// A `Finish` that belongs to no field: the upload ended without a
    /// section left to close.
    fn bare_finish(&mut self, session: SessionId, part: PartId, out: &mut Vec<OutputEnvelope>) {
        self.stop_last = false;
        self.emitted_any = true;
        self.finish_sent = true;
        out.push(OutputEnvelope {
            kind: EnvelopeKind::Unary,
            stream_key: StreamKey { session, part },
            form_name: String::new(),
            file_name: String::new(),
            content_type: None,
            pre_action: PreAction::None,
            post_action: PostAction::Finish,
            body: Vec::new(),
        });
    }
}

#[derive(Debug, Default)]
struct Step {
    envelopes: Vec<OutputEnvelope>,
    conditions: Vec<Condition>,
}

/// Branch, buffer and section state of one session.
#[derive(Debug)]
struct SessionLedger {
    session: SessionId,
    boundary: Boundary,
    max_header_size: usize,
    max_fields: usize,
    max_field_size: Option<usize>,
    next_part: PartId,
    confirmed: Option<BranchRecord>,
    closing: Option<BranchRecord>,
    speculative: Option<SpeculativeBranch>,
    buffer: Option<Buffer>,
    emission: Emission,
    fields: usize,
    finished: bool,
}

impl SessionLedger {
    fn new(session: SessionId, boundary: Boundary, config: &ReassemblyConfig) -> Self {
        // The body starts at a line start, as if preceded by a CRLF.
        let speculative = Some(SpeculativeBranch {
            part: 0,
            bytes: b"\r\n".to_vec(),
        });
        Self {
            session,
            boundary,
            max_header_size: config.get_max_header_size(),
            max_fields: config.get_max_fields(),
            max_field_size: config.get_max_field_size(),
            next_part: 0,
            confirmed: None,
            closing: None,
            speculative,
            buffer: None,
            emission: Emission::default(),
            fields: 0,
            finished: false,
        }
    }

    fn branch_keys(&self) -> Vec<BranchKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(record) = &self.confirmed {
            keys.push(BranchKey {
                session: self.session,
                part: record.segment_start_part,
                kind: BranchKind::Confirmed,
            });
        }
        if let Some(spec) = &self.speculative {
            keys.push(BranchKey {
                session: self.session,
                part: spec.part,
                kind: BranchKind::Speculative,
            });
        }
        keys
    }

    fn buffer_piece(&mut self, piece: DataPiece) -> bool {
        self.buffer.get_or_insert_with(Buffer::default).insert(piece)
    }

    fn buffered(&self) -> usize {
        self.buffer.as_ref().map_or(0, Buffer::len)
    }

    /// Pop the buffer front if it is stale or next in line.
    fn take_buffered(&mut self) -> Option<DataPiece> {
        let buffer = self.buffer.as_mut()?;
        let ready = buffer.front_part().is_some_and(|p| p <= self.next_part);
        let piece = if ready { buffer.pop_front() } else { None };
        if buffer.is_empty() {
            self.buffer = None;
        }
        piece
    }

    /// Apply the piece whose part is `next_part`.
    fn apply(&mut self, piece: DataPiece) -> Registration {
        let session = piece.session();
        let part = piece.part();
        self.next_part = part + 1;

        if self.finished {
            return Registration::new(
                session,
                part,
                Outcome::Discarded(DiscardReason::SessionFinished),
            );
        }

        let mut step = Step::default();
        match piece {
            DataPiece::Unit(unit) => self.apply_unit(unit, &mut step),
            DataPiece::Sub(sub) => self.apply_sub(sub, &mut step),
        }

        let outcome = if self.finished {
            Outcome::SessionFinished
        } else if self.speculative.is_some()
            || self
                .confirmed
                .as_ref()
                .is_some_and(|r| r.end == EndState::Maybe)
        {
            Outcome::AwaitingBoundary
        } else if self
            .confirmed
            .as_ref()
            .is_some_and(|r| r.phase == Phase::Header)
        {
            Outcome::HeaderIncomplete
        } else {
            Outcome::Applied
        };

        let mut reg = Registration::new(session, part, outcome);
        reg.envelopes = step.envelopes;
        reg.conditions = step.conditions;
        reg
    }

    fn apply_unit(&mut self, unit: PieceUnit, step: &mut Step) {
        let PieceUnit {
            part,
            begin,
            end,
            body: owned,
            unblock,
            ..
        } = unit;
        let mut body: &[u8] = &owned;

        if begin == BeginState::Yes {
            self.flush_speculation(step);
            if body.starts_with(self.boundary.delimiter()) {
                body = &body[self.boundary.delimiter().len()..];
                self.start_section(part, step);
            } else {
                step.conditions.push(Condition::MisalignedPiece { part });
            }
        } else if let Some(spec) = self.speculative.take() {
            match match_marker(self.boundary.marker(), &spec.bytes, body) {
                MarkerMatch::Full { consumed } => {
                    body = &body[consumed..];
                    self.start_section(part, step);
                }
                // More bytes are needed, and this piece runs to the chunk end.
                MarkerMatch::Partial if end == EndState::No => {
                    let mut bytes = spec.bytes;
                    bytes.extend_from_slice(body);
                    body = &[];
                    self.speculative = Some(SpeculativeBranch {
                        part: spec.part,
                        bytes,
                    });
                }
                // A CR follows in this chunk, and a CR never continues a
                // marker that already started.
                MarkerMatch::Partial | MarkerMatch::Diverged => self.feed(&spec.bytes, step),
            }
        }

        if !self.finished {
            self.feed(body, step);
        }
        if self.finished {
            return;
        }
        if unblock {
            self.unblock(step);
            return;
        }

        match end {
            EndState::No => {
                if self.speculative.is_none() {
                    self.flush_pending(step);
                }
            }
            EndState::Maybe => {
                if let Some(record) = self.confirmed.as_mut() {
                    record.end = EndState::Maybe;
                }
            }
            EndState::Yes => self.end_section(step),
        }
    }

    fn apply_sub(&mut self, sub: SubPiece, step: &mut Step) {
        let SubPiece { part, body, .. } = sub;

        if let Some(spec) = self.speculative.take() {
            match match_marker(self.boundary.marker(), &spec.bytes, &body) {
                MarkerMatch::Full { consumed } => {
                    self.start_section(part, step);
                    self.feed(&body[consumed..], step);
                    return;
                }
                MarkerMatch::Partial => {
                    let mut bytes = spec.bytes;
                    bytes.extend_from_slice(&body);
                    self.speculative = Some(SpeculativeBranch {
                        part: spec.part,
                        bytes,
                    });
                    return;
                }
                MarkerMatch::Diverged => {
                    step.conditions.push(Condition::DoubleMeaning { part });
                    self.feed(&spec.bytes, step);
                    if self.finished {
                        return;
                    }
                }
            }
        }

        match match_marker(self.boundary.marker(), &[], &body) {
            MarkerMatch::Full { consumed } => {
                self.start_section(part, step);
                self.feed(&body[consumed..], step);
            }
            MarkerMatch::Partial => {
                self.speculative = Some(SpeculativeBranch { part, bytes: body });
            }
            MarkerMatch::Diverged => self.feed(&body, step),
        }
    }

    fn flush_speculation(&mut self, step: &mut Step) {
        if let Some(spec) = self.speculative.take() {
            self.feed(&spec.bytes, step);
        }
    }

    /// A delimiter was confirmed right before the bytes of `part`.
    fn start_section(&mut self, part: PartId, step: &mut Step) {
        self.end_section(step);
        self.confirmed = Some(BranchRecord::new(part));
    }

    /// The current section reached a delimiter.
    fn end_section(&mut self, step: &mut Step) {
        let Some(mut record) = self.confirmed.take() else {
            return;
        };
        if let Some(previous) = self.closing.take() {
            self.close_record(previous, PostAction::Close, step);
        }
        match record.phase {
            Phase::Header => step.conditions.push(Condition::MalformedHeader {
                detail: "section ended before its header was complete".to_string(),
            }),
            Phase::Discard => {}
            Phase::Body => {
                record.end = EndState::Yes;
                self.closing = Some(record);
            }
        }
    }

    /// Emit whatever is left of a finished section.
    fn close_record(&mut self, mut record: BranchRecord, post: PostAction, step: &mut Step) {
        if record.phase != Phase::Body {
            if post == PostAction::Finish {
                self.emission
                    .bare_finish(self.session, record.segment_start_part, &mut step.envelopes);
            }
            return;
        }
        if !record.opened || !record.pending.is_empty() || post == PostAction::Finish {
            let body = std::mem::take(&mut record.pending);
            self.emission
                .emit(self.session, &mut record, body, post, &mut step.envelopes);
        } else {
            // Nothing left to send: the next stream's opener closes this one.
            self.emission.stop_last = true;
        }
    }

    fn resolve_closing(&mut self, post: PostAction, step: &mut Step) {
        if let Some(previous) = self.closing.take() {
            self.close_record(previous, post, step);
        }
    }

    /// Route section bytes to the header accumulator or the pending body.
    fn feed(&mut self, bytes: &[u8], step: &mut Step) {
        let Some(record) = self.confirmed.as_mut() else {
            // Preamble, or bytes after a dropped section.
            return;
        };
        match record.phase {
            Phase::Discard => {}
            Phase::Body => self.push_body(bytes, step),
            Phase::Header => {
                let (status, rest) = record.disposition.accumulate(bytes, self.max_header_size);
                let leading_known = record.disposition.leading_known();
                match status {
                    HeaderStatus::Incomplete => {
                        if leading_known {
                            self.resolve_closing(PostAction::Close, step);
                        }
                    }
                    HeaderStatus::Terminal => self.finish(step),
                    HeaderStatus::TooLarge => {
                        let size = record.disposition.raw_header().len();
                        record.phase = Phase::Discard;
                        step.conditions.push(Condition::HeaderTooLarge {
                            size,
                            max: self.max_header_size,
                        });
                        self.resolve_closing(PostAction::Close, step);
                    }
                    HeaderStatus::Complete => self.complete_header(rest, step),
                }
            }
        }
    }

    fn complete_header(&mut self, rest: &[u8], step: &mut Step) {
        self.resolve_closing(PostAction::Close, step);
        self.fields += 1;
        let Some(record) = self.confirmed.as_mut() else {
            return;
        };

        if self.fields > self.max_fields {
            record.phase = Phase::Discard;
            step.conditions.push(Condition::TooManyFields {
                count: self.fields,
                max: self.max_fields,
            });
            return;
        }
        if let Some(problem) = record.disposition.problem() {
            step.conditions.push(Condition::MalformedHeader {
                detail: problem.to_string(),
            });
        }
        record.phase = Phase::Body;
        self.push_body(rest, step);
    }

    fn push_body(&mut self, bytes: &[u8], step: &mut Step) {
        let Some(record) = self.confirmed.as_mut() else {
            return;
        };
        record.pending.extend_from_slice(bytes);

        let Some(max) = self.max_field_size else {
            return;
        };
        let size = record.emitted_bytes + record.pending.len();
        if size > max {
            record.pending.truncate(max.saturating_sub(record.emitted_bytes));
            let body = std::mem::take(&mut record.pending);
            self.emission
                .emit(self.session, record, body, PostAction::Stop, &mut step.envelopes);
            record.phase = Phase::Discard;
            step.conditions.push(Condition::FieldTooLarge { size, max });
        }
    }

    /// The chunk ran out in the middle of a field body.
    fn flush_pending(&mut self, step: &mut Step) {
        let Some(record) = self.confirmed.as_mut() else {
            return;
        };
        record.end = EndState::No;
        if record.phase != Phase::Body || record.pending.is_empty() {
            return;
        }
        let body = std::mem::take(&mut record.pending);
        self.emission
            .emit(self.session, record, body, PostAction::Continue, &mut step.envelopes);
    }

    /// The closing delimiter was confirmed.
    fn finish(&mut self, step: &mut Step) {
        self.speculative = None;
        let terminal = self.confirmed.take();
        match self.closing.take() {
            Some(previous) => self.close_record(previous, PostAction::Finish, step),
            None => {
                let part = terminal.map_or(self.next_part.saturating_sub(1), |r| {
                    r.segment_start_part
                });
                self.emission
                    .bare_finish(self.session, part, &mut step.envelopes);
            }
        }
        self.finished = true;
    }

    /// The connection closed before the closing delimiter.
    fn unblock(&mut self, step: &mut Step) {
        if self.finished {
            return;
        }
        self.flush_speculation(step);
        if self.finished {
            return;
        }

        let current_open = self
            .confirmed
            .as_ref()
            .is_some_and(|r| r.phase == Phase::Body);
        let post = if current_open {
            PostAction::Close
        } else {
            PostAction::Finish
        };
        self.resolve_closing(post, step);

        if let Some(mut record) = self.confirmed.take() {
            if record.phase == Phase::Body {
                let body = std::mem::take(&mut record.pending);
                self.emission.emit(
                    self.session,
                    &mut record,
                    body,
                    PostAction::Finish,
                    &mut step.envelopes,
                );
            }
        }
        if !self.emission.finish_sent {
            self.emission.bare_finish(
                self.session,
                self.next_part.saturating_sub(1),
                &mut step.envelopes,
            );
        }
        self.finished = true;
    }
}

struct SessionSlot {
    ledger: Mutex<SessionLedger>,
    counter: Mutex<CompletionCounter>,
}

/// All in-flight sessions.
pub struct Store {
    config: ReassemblyConfig,
    sessions: Mutex<HashMap<SessionId, Arc<SessionSlot>>>,
    retired: Mutex<VecDeque<SessionId>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.config)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(ReassemblyConfig::default())
    }
}

impl Store {
    /// Create an empty store.
    #[must_use]
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            retired: Mutex::new(VecDeque::new()),
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    /// Number of sessions with live state.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns true if the session has live state.
    #[must_use]
    pub fn contains(&self, session: SessionId) -> bool {
        self.sessions.lock().contains_key(&session)
    }

    /// Returns true if the session finished and was purged recently.
    #[must_use]
    pub fn is_retired(&self, session: SessionId) -> bool {
        self.retired.lock().contains(&session)
    }

    /// Drop a session's live state without emitting anything.
    ///
    /// Used when the consumer of a session's envelopes failed; the session
    /// is retired like a finished one. Returns false if there was no state.
    pub fn abort(&self, session: SessionId) -> bool {
        let removed = self.purge(session);
        if removed {
            tracing::warn!(session = %session, "session aborted");
        }
        removed
    }

    /// Forget that a session finished, so its id can start a new upload.
    ///
    /// Returns true if the id was retired.
    pub fn release(&self, session: SessionId) -> bool {
        let mut retired = self.retired.lock();
        let before = retired.len();
        retired.retain(|s| *s != session);
        before != retired.len()
    }

    /// Diagnostic view of a session.
    #[must_use]
    pub fn snapshot(&self, session: SessionId) -> Option<SessionSnapshot> {
        let slot = self.sessions.lock().get(&session).cloned()?;
        let ledger = slot.ledger.lock();
        let counter = *slot.counter.lock();
        Some(SessionSnapshot {
            next_part: ledger.next_part,
            branches: ledger.branch_keys(),
            buffered: ledger.buffered(),
            has_buffer: ledger.buffer.is_some(),
            counter,
            finished: ledger.finished,
        })
    }

    /// Count `n` pieces arriving for `session`, creating it if needed.
    pub fn inc(&self, session: SessionId, boundary: &Boundary, n: u64) {
        if self.is_retired(session) {
            return;
        }
        let slot = self.slot(session, boundary);
        slot.counter.lock().inc(n);
    }

    /// Register one piece.
    ///
    /// The piece is applied if it is the session's next part, parked if it is
    /// ahead, and dropped if its part was already consumed.
    pub fn register(
        &self,
        piece: DataPiece,
        boundary: &Boundary,
    ) -> Result<Registration, ReassemblyError> {
        let session = piece.session();
        let part = piece.part();
        if self.is_retired(session) {
            return Ok(Registration::new(
                session,
                part,
                Outcome::Discarded(DiscardReason::SessionFinished),
            ));
        }

        let slot = self.slot(session, boundary);
        let mut ledger = slot.ledger.lock();
        if ledger.boundary != *boundary {
            drop(ledger);
            self.purge(session);
            return Err(ReassemblyError::BoundaryMismatch { session });
        }

        let mut reg = match part.cmp(&ledger.next_part) {
            std::cmp::Ordering::Less => Registration::new(
                session,
                part,
                Outcome::Discarded(DiscardReason::StalePart),
            ),
            std::cmp::Ordering::Greater => {
                let len = ledger.buffered();
                let max = self.config.get_max_buffered_pieces();
                if len >= max {
                    drop(ledger);
                    self.purge(session);
                    tracing::warn!(session = %session, len, max, "buffer overflow, session aborted");
                    return Err(ReassemblyError::BufferOverflow { session, len, max });
                }
                let expected = ledger.next_part;
                if ledger.buffer_piece(piece) {
                    tracing::debug!(session = %session, part, expected, "buffered out-of-order piece");
                    let mut reg = Registration::new(session, part, Outcome::Buffered);
                    reg.conditions
                        .push(Condition::UnexpectedPart { expected, got: part });
                    return Ok(reg);
                }
                Registration::new(
                    session,
                    part,
                    Outcome::Discarded(DiscardReason::DuplicatePart),
                )
            }
            std::cmp::Ordering::Equal => ledger.apply(piece),
        };

        reg.order = self.settle(&slot, &ledger);
        drop(ledger);
        if reg.order.is_last() || slot.counter.lock().is_exhausted() {
            self.purge(session);
            reg.purged = true;
        }
        Ok(reg)
    }

    /// Apply every buffered piece of `session` that is now next in line.
    pub fn register_buffer(&self, session: SessionId) -> Result<Vec<Registration>, ReassemblyError> {
        let Some(slot) = self.sessions.lock().get(&session).cloned() else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        loop {
            let mut ledger = slot.ledger.lock();
            let Some(piece) = ledger.take_buffered() else {
                break;
            };
            let mut reg = if piece.part() < ledger.next_part {
                Registration::new(
                    session,
                    piece.part(),
                    Outcome::Discarded(DiscardReason::StalePart),
                )
            } else {
                ledger.apply(piece)
            };
            reg.order = self.settle(&slot, &ledger);
            drop(ledger);

            let done = reg.order.is_last() || slot.counter.lock().is_exhausted();
            if done {
                self.purge(session);
                reg.purged = true;
            }
            out.push(reg);
            if done {
                break;
            }
        }
        Ok(out)
    }

    /// Count one consumed piece, unblocking the counter once the session ended.
    fn settle(&self, slot: &SessionSlot, ledger: &SessionLedger) -> Order {
        let mut counter = slot.counter.lock();
        if ledger.finished {
            counter.unblock();
        }
        counter.dec()
    }

    fn slot(&self, session: SessionId, boundary: &Boundary) -> Arc<SessionSlot> {
        let mut sessions = self.sessions.lock();
        Arc::clone(sessions.entry(session).or_insert_with(|| {
            tracing::debug!(session = %session, boundary = %boundary, "session opened");
            Arc::new(SessionSlot {
                ledger: Mutex::new(SessionLedger::new(session, boundary.clone(), &self.config)),
                counter: Mutex::new(CompletionCounter::new()),
            })
        }))
    }

    fn purge(&self, session: SessionId) -> bool {
        if self.sessions.lock().remove(&session).is_none() {
            return false;
        }
        let mut retired = self.retired.lock();
        retired.push_back(session);
        while retired.len() > self.config.get_retired_capacity() {
            retired.pop_front();
        }
        tracing::debug!(session = %session, "session purged");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boundary() -> Boundary {
        Boundary::new("B").unwrap()
    }

    fn sid() -> SessionId {
        SessionId::new(1)
    }

    fn unit(part: PartId, begin: BeginState, end: EndState, body: &[u8]) -> DataPiece {
        PieceUnit::new(sid(), part, begin, end, body).into()
    }

    fn sub(part: PartId, body: &[u8]) -> DataPiece {
        SubPiece::new(sid(), part, body).into()
    }

    const HEAD_A: &[u8] = b"--B\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n";

    fn with_body(head: &[u8], body: &[u8]) -> Vec<u8> {
        let mut v = head.to_vec();
        v.extend_from_slice(body);
        v
    }

    #[test]
    fn test_single_field_upload() {
        let store = Store::default();
        let b = boundary();
        store.inc(sid(), &b, 2);

        let r0 = store
            .register(unit(0, BeginState::No, EndState::Yes, &with_body(HEAD_A, b"v")), &b)
            .unwrap();
        assert!(r0.envelopes.is_empty());
        assert_eq!(r0.outcome, Outcome::Applied);
        assert_eq!(r0.order, Order::First);

        let r1 = store
            .register(unit(1, BeginState::Yes, EndState::No, b"--B--"), &b)
            .unwrap();
        assert_eq!(r1.outcome, Outcome::SessionFinished);
        assert_eq!(r1.order, Order::Last);
        assert!(r1.purged);
        assert_eq!(r1.envelopes.len(), 1);
        let env = &r1.envelopes[0];
        assert_eq!(env.kind, EnvelopeKind::Unary);
        assert_eq!(env.form_name, "a");
        assert_eq!(env.body, b"v");
        assert_eq!(env.pre_action, PreAction::Start);
        assert_eq!(env.post_action, PostAction::Finish);
        assert!(!store.contains(sid()));
        assert!(store.is_retired(sid()));
    }

    #[test]
    fn test_out_of_order_piece_is_buffered_then_drained() {
        let store = Store::default();
        let b = boundary();

        let r = store
            .register(unit(1, BeginState::Yes, EndState::No, b"--B--"), &b)
            .unwrap();
        assert_eq!(r.outcome, Outcome::Buffered);
        assert_eq!(
            r.conditions,
            vec![Condition::UnexpectedPart {
                expected: 0,
                got: 1
            }]
        );
        let snap = store.snapshot(sid()).unwrap();
        assert_eq!(snap.buffered, 1);
        assert!(snap.has_buffer);

        store
            .register(unit(0, BeginState::No, EndState::Yes, &with_body(HEAD_A, b"v")), &b)
            .unwrap();
        let drained = store.register_buffer(sid()).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].outcome, Outcome::SessionFinished);
        assert_eq!(drained[0].envelopes[0].body, b"v");
    }

    #[test]
    fn test_identical_buffered_piece_is_dropped() {
        let store = Store::default();
        let b = boundary();
        let piece = unit(3, BeginState::No, EndState::No, b"x");
        store.register(piece.clone(), &b).unwrap();
        let again = store.register(piece, &b).unwrap();
        assert_eq!(
            again.outcome,
            Outcome::Discarded(DiscardReason::DuplicatePart)
        );
        assert_eq!(store.snapshot(sid()).unwrap().buffered, 1);
    }

    #[test]
    fn test_buffer_deleted_once_drained() {
        let store = Store::default();
        let b = boundary();
        store
            .register(unit(1, BeginState::No, EndState::No, b"more"), &b)
            .unwrap();
        store
            .register(unit(0, BeginState::No, EndState::No, &with_body(HEAD_A, b"v")), &b)
            .unwrap();
        store.register_buffer(sid()).unwrap();
        let snap = store.snapshot(sid()).unwrap();
        assert!(!snap.has_buffer);
        assert_eq!(snap.next_part, 2);
    }

    #[test]
    fn test_buffer_overflow_aborts_session() {
        let store = Store::new(ReassemblyConfig::new().max_buffered_pieces(1));
        let b = boundary();
        store
            .register(unit(2, BeginState::No, EndState::No, b"x"), &b)
            .unwrap();
        let err = store
            .register(unit(3, BeginState::No, EndState::No, b"y"), &b)
            .unwrap_err();
        assert!(matches!(err, ReassemblyError::BufferOverflow { len: 1, max: 1, .. }));
        assert!(!store.contains(sid()));
    }

    #[test]
    fn test_boundary_mismatch_aborts_session() {
        let store = Store::default();
        store
            .register(unit(0, BeginState::No, EndState::No, b"--B"), &boundary())
            .unwrap();
        let other = Boundary::new("C").unwrap();
        let err = store
            .register(unit(1, BeginState::No, EndState::No, b"x"), &other)
            .unwrap_err();
        assert_eq!(err, ReassemblyError::BoundaryMismatch { session: sid() });
    }

    #[test]
    fn test_maybe_then_exact_marker_promotes() {
        let store = Store::default();
        let b = boundary();

        let r0 = store
            .register(unit(0, BeginState::No, EndState::Maybe, &with_body(HEAD_A, b"hello")), &b)
            .unwrap();
        assert_eq!(r0.outcome, Outcome::AwaitingBoundary);
        assert!(r0.envelopes.is_empty());

        let r1 = store.register(sub(1, b"\r\n--B"), &b).unwrap();
        assert!(r1.envelopes.is_empty());
        let snap = store.snapshot(sid()).unwrap();
        assert_eq!(
            snap.branches,
            vec![BranchKey {
                session: sid(),
                part: 1,
                kind: BranchKind::Confirmed
            }]
        );

        let r2 = store
            .register(
                unit(
                    2,
                    BeginState::No,
                    EndState::No,
                    b"\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\nworld",
                ),
                &b,
            )
            .unwrap();
        assert_eq!(r2.envelopes.len(), 2);
        assert_eq!(r2.envelopes[0].body, b"hello");
        assert_eq!(r2.envelopes[0].post_action, PostAction::Close);
        assert_eq!(r2.envelopes[0].kind, EnvelopeKind::Unary);
        assert_eq!(r2.envelopes[1].form_name, "b");
        assert_eq!(r2.envelopes[1].pre_action, PreAction::Open);
        assert_eq!(r2.envelopes[1].post_action, PostAction::Continue);
        assert_eq!(r2.envelopes[1].stream_key.part, 1);
    }

    #[test]
    fn test_maybe_then_diverging_bytes_flow_as_content() {
        let store = Store::default();
        let b = boundary();
        store
            .register(unit(0, BeginState::No, EndState::Maybe, &with_body(HEAD_A, b"hello")), &b)
            .unwrap();
        let r1 = store.register(sub(1, b"\r\n-"), &b).unwrap();
        assert_eq!(r1.outcome, Outcome::AwaitingBoundary);
        let snap = store.snapshot(sid()).unwrap();
        assert!(snap.branches.iter().any(|k| k.kind == BranchKind::Speculative));

        let r2 = store
            .register(unit(2, BeginState::No, EndState::No, b"x tail"), &b)
            .unwrap();
        assert_eq!(r2.envelopes.len(), 1);
        assert_eq!(r2.envelopes[0].body, b"hello\r\n-x tail");
        assert_eq!(r2.envelopes[0].post_action, PostAction::Continue);
        let snap = store.snapshot(sid()).unwrap();
        assert!(snap.branches.iter().all(|k| k.kind == BranchKind::Confirmed));
    }

    #[test]
    fn test_begin_maybe_is_handled_like_begin_no() {
        let b = boundary();
        let run = |begin: BeginState| {
            let store = Store::default();
            store
                .register(unit(0, BeginState::No, EndState::Maybe, &with_body(HEAD_A, b"x")), &b)
                .unwrap();
            store.register(sub(1, b"\r\n-"), &b).unwrap();
            store
                .register(unit(2, begin, EndState::No, b"-B--"), &b)
                .unwrap()
        };
        let no = run(BeginState::No);
        let maybe = run(BeginState::Maybe);
        assert_eq!(no.outcome, Outcome::SessionFinished);
        assert_eq!(no, maybe);
    }

    #[test]
    fn test_stale_part_is_discarded() {
        let store = Store::default();
        let b = boundary();
        store
            .register(unit(0, BeginState::No, EndState::No, b"preamble"), &b)
            .unwrap();
        let r = store
            .register(unit(0, BeginState::No, EndState::No, b"again"), &b)
            .unwrap();
        assert_eq!(r.outcome, Outcome::Discarded(DiscardReason::StalePart));
    }

    #[test]
    fn test_preamble_is_dropped() {
        let store = Store::default();
        let b = boundary();
        let r = store
            .register(
                unit(0, BeginState::No, EndState::Yes, b"this is the preamble"),
                &b,
            )
            .unwrap();
        assert!(r.envelopes.is_empty());
        let r = store
            .register(
                unit(
                    1,
                    BeginState::Yes,
                    EndState::No,
                    &with_body(HEAD_A, b"value"),
                ),
                &b,
            )
            .unwrap();
        assert_eq!(r.envelopes.len(), 1);
        assert_eq!(r.envelopes[0].body, b"value");
        assert_eq!(r.envelopes[0].pre_action, PreAction::Start);
    }

    #[test]
    fn test_unblock_flushes_open_field_with_finish() {
        let store = Store::default();
        let b = boundary();
        store.inc(sid(), &b, 2);
        let r0 = store
            .register(unit(0, BeginState::No, EndState::Maybe, &with_body(HEAD_A, b"partial")), &b)
            .unwrap();
        assert!(r0.envelopes.is_empty());
        let r1 = store
            .register(PieceUnit::unblock(sid(), 1).into(), &b)
            .unwrap();
        assert_eq!(r1.outcome, Outcome::SessionFinished);
        assert!(r1.purged);
        assert_eq!(r1.envelopes.len(), 1);
        assert_eq!(r1.envelopes[0].body, b"partial");
        assert_eq!(r1.envelopes[0].post_action, PostAction::Finish);
    }

    #[test]
    fn test_unblock_without_fields_emits_bare_finish() {
        let store = Store::default();
        let b = boundary();
        let r = store
            .register(PieceUnit::unblock(sid(), 0).into(), &b)
            .unwrap();
        assert_eq!(r.envelopes.len(), 1);
        assert_eq!(r.envelopes[0].pre_action, PreAction::None);
        assert_eq!(r.envelopes[0].post_action, PostAction::Finish);
        assert!(r.envelopes[0].body.is_empty());
    }

    #[test]
    fn test_stop_last_when_closed_stream_has_no_tail() {
        let store = Store::default();
        let b = boundary();
        let r0 = store
            .register(unit(0, BeginState::No, EndState::No, &with_body(HEAD_A, b"abc")), &b)
            .unwrap();
        assert_eq!(r0.envelopes[0].post_action, PostAction::Continue);

        store.register(unit(1, BeginState::No, EndState::Yes, b""), &b).unwrap();
        let r2 = store
            .register(
                unit(
                    2,
                    BeginState::Yes,
                    EndState::Yes,
                    b"--B\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\nxyz",
                ),
                &b,
            )
            .unwrap();
        assert!(r2.envelopes.is_empty());

        let r3 = store
            .register(unit(3, BeginState::Yes, EndState::No, b"--B--"), &b)
            .unwrap();
        assert_eq!(r3.envelopes.len(), 1);
        let env = &r3.envelopes[0];
        assert_eq!(env.form_name, "b");
        assert_eq!(env.pre_action, PreAction::StopLast);
        assert_eq!(env.post_action, PostAction::Finish);
        assert_eq!(env.kind, EnvelopeKind::Unary);
    }

    #[test]
    fn test_too_many_fields_drops_extra_fields() {
        let store = Store::new(ReassemblyConfig::new().max_fields(1));
        let b = boundary();
        store
            .register(unit(0, BeginState::No, EndState::Yes, &with_body(HEAD_A, b"1")), &b)
            .unwrap();
        let r1 = store
            .register(
                unit(
                    1,
                    BeginState::Yes,
                    EndState::Yes,
                    b"--B\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\n2",
                ),
                &b,
            )
            .unwrap();
        assert_eq!(
            r1.conditions,
            vec![Condition::TooManyFields { count: 2, max: 1 }]
        );
        assert_eq!(r1.envelopes.len(), 1);
        assert_eq!(r1.envelopes[0].form_name, "a");
        assert_eq!(r1.envelopes[0].post_action, PostAction::Close);

        let r2 = store
            .register(unit(2, BeginState::Yes, EndState::No, b"--B--"), &b)
            .unwrap();
        assert_eq!(r2.envelopes.len(), 1);
        assert_eq!(r2.envelopes[0].pre_action, PreAction::None);
        assert_eq!(r2.envelopes[0].post_action, PostAction::Finish);
    }

    #[test]
    fn test_field_too_large_is_stopped() {
        let store = Store::new(ReassemblyConfig::new().max_field_size(4));
        let b = boundary();
        let r = store
            .register(unit(0, BeginState::No, EndState::No, &with_body(HEAD_A, b"abcdefgh")), &b)
            .unwrap();
        assert_eq!(r.envelopes.len(), 1);
        assert_eq!(r.envelopes[0].body, b"abcd");
        assert_eq!(r.envelopes[0].post_action, PostAction::Stop);
        assert_eq!(
            r.conditions,
            vec![Condition::FieldTooLarge { size: 8, max: 4 }]
        );
    }

    #[test]
    fn test_malformed_header_still_flows() {
        let store = Store::default();
        let b = boundary();
        let r = store
            .register(
                unit(
                    0,
                    BeginState::No,
                    EndState::No,
                    b"--B\r\nContent-Disposition: form-data\r\n\r\nbody",
                ),
                &b,
            )
            .unwrap();
        assert_eq!(r.envelopes.len(), 1);
        assert_eq!(r.envelopes[0].form_name, "");
        assert_eq!(r.envelopes[0].body, b"body");
        assert_eq!(
            r.conditions,
            vec![Condition::MalformedHeader {
                detail: "missing name parameter".to_string()
            }]
        );
    }

    #[test]
    fn test_header_incomplete_outcome() {
        let store = Store::default();
        let b = boundary();
        let r = store
            .register(
                unit(0, BeginState::No, EndState::No, b"--B\r\nContent-Disposition: form"),
                &b,
            )
            .unwrap();
        assert_eq!(r.outcome, Outcome::HeaderIncomplete);
    }

    #[test]
    fn test_pieces_after_finish_are_discarded() {
        let store = Store::default();
        let b = boundary();
        store.inc(sid(), &b, 1);
        store
            .register(unit(0, BeginState::No, EndState::No, b"--B--\r\n"), &b)
            .unwrap();
        assert!(!store.contains(sid()));
        store.inc(sid(), &b, 1);
        let late = store
            .register(unit(1, BeginState::No, EndState::No, b"epilogue"), &b)
            .unwrap();
        assert_eq!(
            late.outcome,
            Outcome::Discarded(DiscardReason::SessionFinished)
        );
        assert!(!store.contains(sid()));
    }

    #[test]
    fn test_second_sub_piece_resolves_the_first_as_content() {
        let store = Store::default();
        let b = boundary();
        store
            .register(unit(0, BeginState::No, EndState::Maybe, &with_body(HEAD_A, b"hello")), &b)
            .unwrap();
        store.register(sub(1, b"\r\n-"), &b).unwrap();

        let r2 = store.register(sub(2, b"\r\n--B"), &b).unwrap();
        assert_eq!(r2.conditions, vec![Condition::DoubleMeaning { part: 2 }]);
        assert!(r2.envelopes.is_empty());
        let snap = store.snapshot(sid()).unwrap();
        assert_eq!(
            snap.branches,
            vec![BranchKey {
                session: sid(),
                part: 2,
                kind: BranchKind::Confirmed
            }]
        );

        let r3 = store
            .register(
                unit(
                    3,
                    BeginState::No,
                    EndState::No,
                    b"\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\nnext",
                ),
                &b,
            )
            .unwrap();
        assert_eq!(r3.envelopes.len(), 2);
        assert_eq!(r3.envelopes[0].form_name, "a");
        assert_eq!(r3.envelopes[0].body, b"hello\r\n-");
        assert_eq!(r3.envelopes[0].post_action, PostAction::Close);
        assert_eq!(r3.envelopes[1].form_name, "b");
        assert_eq!(r3.envelopes[1].pre_action, PreAction::Open);
        assert_eq!(r3.envelopes[1].body, b"next");
        assert_eq!(r3.envelopes[1].stream_key.part, 2);
    }

    #[test]
    fn test_begin_without_delimiter_is_misaligned() {
        let store = Store::default();
        let b = boundary();
        store
            .register(unit(0, BeginState::No, EndState::No, &with_body(HEAD_A, b"abc")), &b)
            .unwrap();

        let r1 = store
            .register(unit(1, BeginState::Yes, EndState::No, b"stray bytes"), &b)
            .unwrap();
        assert_eq!(r1.conditions, vec![Condition::MisalignedPiece { part: 1 }]);
        assert_eq!(r1.envelopes.len(), 1);
        assert_eq!(r1.envelopes[0].form_name, "a");
        assert_eq!(r1.envelopes[0].pre_action, PreAction::Continue);
        assert_eq!(r1.envelopes[0].body, b"stray bytes");
    }

    #[test]
    fn test_abort_drops_live_state() {
        let store = Store::default();
        let b = boundary();
        store.inc(sid(), &b, 1);
        store
            .register(unit(0, BeginState::No, EndState::No, &with_body(HEAD_A, b"old")), &b)
            .unwrap();
        assert!(store.contains(sid()));

        assert!(store.abort(sid()));
        assert!(!store.contains(sid()));
        assert!(store.is_retired(sid()));
        assert!(!store.abort(sid()));
    }

    #[test]
    fn test_release_lets_a_retired_id_start_over() {
        let store = Store::default();
        let b = boundary();
        store.inc(sid(), &b, 1);
        store
            .register(unit(0, BeginState::No, EndState::No, b"--B--"), &b)
            .unwrap();
        assert!(store.is_retired(sid()));

        assert!(store.release(sid()));
        assert!(!store.release(sid()));
        store.inc(sid(), &b, 1);
        let r = store
            .register(unit(0, BeginState::No, EndState::No, &with_body(HEAD_A, b"new")), &b)
            .unwrap();
        assert_eq!(r.envelopes.len(), 1);
        assert_eq!(r.envelopes[0].pre_action, PreAction::Start);
        assert_eq!(r.envelopes[0].body, b"new");
    }
}
