// src/exam.rs

//! In-memory state of the running attempt. The container is the single
//! source of truth for answers, flags, navigation and the countdown; it
//! never touches the network. UI actions and inbound channel messages are
//! the only things that mutate it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::AppError,
    models::{
        answer::{AnswerPayload, AnswerRecord},
        checkpoint::Checkpoint,
        exam::{AttemptSnapshot, ExamSnapshot},
        message::{EVENT_TIME_EXPIRED, ServerMessage},
        question::Question,
        submission::SubmittedAnswer,
    },
};

const LOW_TIME_SECONDS: i64 = 600;
const CRITICAL_TIME_SECONDS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerData {
    pub answer: Option<AnswerPayload>,
    pub is_flagged: bool,
    pub time_spent_seconds: i64,
    /// Last sequence issued for this question; `0` means none yet.
    pub sequence: i64,
    pub last_updated: DateTime<Utc>,
}

impl AnswerData {
    fn checkpoint(&self, attempt_id: i64, question_id: i64) -> Checkpoint {
        Checkpoint {
            attempt_id,
            question_id,
            answer: self.answer.clone(),
            is_flagged: self.is_flagged,
            time_spent_seconds: self.time_spent_seconds,
            sequence: self.sequence,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.answer.as_ref().is_some_and(AnswerPayload::is_answered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExamProgress {
    pub total: usize,
    pub answered: usize,
    pub flagged: usize,
    pub unanswered: usize,
    pub percentage: f64,
}

/// Value last handed to a checkpoint, per question.
#[derive(Debug, Clone, PartialEq)]
struct Shadow {
    answer: Option<AnswerPayload>,
    is_flagged: bool,
}

#[derive(Debug)]
pub struct ExamState {
    exam: Option<ExamSnapshot>,
    attempt: Option<AttemptSnapshot>,
    answers: BTreeMap<i64, AnswerData>,
    shadow: BTreeMap<i64, Shadow>,
    acked: BTreeMap<i64, i64>,
    current_question_index: usize,
    time_remaining_seconds: i64,
    /// Client clock minus server clock, in milliseconds.
    server_time_offset_ms: i64,
    is_connected: bool,
    is_syncing: bool,
    is_online: bool,
    queued_checkpoints: i64,
    last_sync_time: Option<DateTime<Utc>>,
    submit_requested: bool,
    is_submitting: bool,
}

impl Default for ExamState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExamState {
    pub fn new() -> Self {
        Self {
            exam: None,
            attempt: None,
            answers: BTreeMap::new(),
            shadow: BTreeMap::new(),
            acked: BTreeMap::new(),
            current_question_index: 0,
            time_remaining_seconds: 0,
            server_time_offset_ms: 0,
            is_connected: false,
            is_syncing: false,
            is_online: true,
            queued_checkpoints: 0,
            last_sync_time: None,
            submit_requested: false,
            is_submitting: false,
        }
    }

    /// Loads the paper and the attempt. Questions are ordered by `order_number`.
    pub fn load(&mut self, mut exam: ExamSnapshot, attempt: AttemptSnapshot) {
        exam.questions.sort_by_key(|q| (q.order_number, q.id));
        self.time_remaining_seconds = attempt.time_remaining_seconds;
        self.exam = Some(exam);
        self.attempt = Some(attempt);
        self.current_question_index = 0;
    }

    /// Rebuilds answers from persisted mirrors after a reload. Mirrors still
    /// waiting for sync stay out of the shadow so auto-save pushes them again.
    pub fn restore_answers(&mut self, records: Vec<AnswerRecord>) {
        for record in records {
            if !record.needs_sync {
                self.shadow.insert(
                    record.question_id,
                    Shadow {
                        answer: record.answer.clone(),
                        is_flagged: record.is_flagged,
                    },
                );
                self.acked.insert(record.question_id, record.sequence);
            }
            self.answers.insert(
                record.question_id,
                AnswerData {
                    answer: record.answer,
                    is_flagged: record.is_flagged,
                    time_spent_seconds: record.time_spent_seconds,
                    sequence: record.sequence,
                    last_updated: record.last_sync_attempt.unwrap_or_else(Utc::now),
                },
            );
        }
    }

    pub fn exam(&self) -> Option<&ExamSnapshot> {
        self.exam.as_ref()
    }

    pub fn attempt(&self) -> Option<&AttemptSnapshot> {
        self.attempt.as_ref()
    }

    fn attempt_id(&self) -> Result<i64, AppError> {
        self.attempt
            .as_ref()
            .map(|a| a.id)
            .ok_or_else(|| AppError::BadRequest("No attempt loaded".to_string()))
    }

    fn question(&self, question_id: i64) -> Option<&Question> {
        self.exam
            .as_ref()
            .and_then(|e| e.questions.iter().find(|q| q.id == question_id))
    }

    // ===== ANSWERS =====

    /// Records an answer change and issues the checkpoint for it. Every call
    /// bumps the question's sequence; `time_spent_seconds` accumulates.
    pub fn set_answer(
        &mut self,
        question_id: i64,
        answer: Option<AnswerPayload>,
        time_spent_seconds: i64,
    ) -> Result<Checkpoint, AppError> {
        let attempt_id = self.attempt_id()?;

        if self.exam.is_some() {
            let question = self.question(question_id).ok_or_else(|| {
                AppError::NotFound(format!("Question {} is not part of this exam", question_id))
            })?;
            if let Some(payload) = &answer {
                if !question.question_type.accepts(payload) {
                    return Err(AppError::BadRequest(format!(
                        "Answer shape does not fit a {:?} question",
                        question.question_type
                    )));
                }
            }
        }

        let entry = self.answers.entry(question_id).or_insert_with(|| AnswerData {
            answer: None,
            is_flagged: false,
            time_spent_seconds: 0,
            sequence: 0,
            last_updated: Utc::now(),
        });
        entry.answer = answer;
        entry.time_spent_seconds += time_spent_seconds.max(0);
        entry.sequence += 1;
        entry.last_updated = Utc::now();

        let checkpoint = entry.checkpoint(attempt_id, question_id);
        self.shadow.insert(
            question_id,
            Shadow {
                answer: checkpoint.answer.clone(),
                is_flagged: checkpoint.is_flagged,
            },
        );
        Ok(checkpoint)
    }

    /// Flags or unflags a question. Answer and sequence are left untouched;
    /// the change reaches the server through the next auto-save.
    pub fn flag_question(&mut self, question_id: i64, is_flagged: bool) {
        let entry = self.answers.entry(question_id).or_insert_with(|| AnswerData {
            answer: None,
            is_flagged: false,
            time_spent_seconds: 0,
            sequence: 0,
            last_updated: Utc::now(),
        });
        entry.is_flagged = is_flagged;
        entry.last_updated = Utc::now();
    }

    /// Compares current answers against what was last checkpointed and issues
    /// a new-sequence checkpoint for every difference.
    pub fn collect_deltas(&mut self) -> Result<Vec<Checkpoint>, AppError> {
        let attempt_id = self.attempt_id()?;
        let mut deltas = Vec::new();

        for (question_id, data) in self.answers.iter_mut() {
            let current = Shadow {
                answer: data.answer.clone(),
                is_flagged: data.is_flagged,
            };
            if self.shadow.get(question_id) == Some(&current) {
                continue;
            }
            data.sequence += 1;
            data.last_updated = Utc::now();
            deltas.push(data.checkpoint(attempt_id, *question_id));
            self.shadow.insert(*question_id, current);
        }

        Ok(deltas)
    }

    pub fn answer(&self, question_id: i64) -> Option<&AnswerData> {
        self.answers.get(&question_id)
    }

    pub fn answers(&self) -> &BTreeMap<i64, AnswerData> {
        &self.answers
    }

    pub fn is_question_answered(&self, question_id: i64) -> bool {
        self.answers
            .get(&question_id)
            .is_some_and(AnswerData::is_answered)
    }

    pub fn is_question_flagged(&self, question_id: i64) -> bool {
        self.answers
            .get(&question_id)
            .is_some_and(|a| a.is_flagged)
    }

    /// Highest sequence the server acknowledged for a question.
    pub fn acked_sequence(&self, question_id: i64) -> Option<i64> {
        self.acked.get(&question_id).copied()
    }

    pub fn mark_acked(&mut self, question_id: i64, sequence: i64) {
        let acked = self.acked.entry(question_id).or_insert(sequence);
        *acked = (*acked).max(sequence);
    }

    /// Final answer set for the submission envelope, ordered by question.
    pub fn submission_answers(&self) -> Vec<SubmittedAnswer> {
        self.answers
            .iter()
            .map(|(question_id, data)| SubmittedAnswer {
                question_id: *question_id,
                answer: data.answer.clone(),
                is_flagged: data.is_flagged,
                time_spent_seconds: data.time_spent_seconds,
                sequence: data.sequence,
            })
            .collect()
    }

    // ===== INBOUND MESSAGES =====

    pub fn apply_server_message(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::Connected {
                time_remaining_seconds,
                ..
            } => {
                self.is_connected = true;
                self.time_remaining_seconds = *time_remaining_seconds;
            }
            ServerMessage::CheckpointAck(ack) => {
                self.is_syncing = false;
                self.last_sync_time = Some(Utc::now());
                self.time_remaining_seconds = ack.time_remaining_seconds;
                self.mark_acked(ack.question_id, ack.sequence);
            }
            ServerMessage::CheckpointError { .. } => {
                self.is_syncing = false;
            }
            ServerMessage::TimeUpdate {
                server_time,
                time_remaining_seconds,
                is_expired,
                ..
            } => {
                self.sync_server_time(*server_time, *time_remaining_seconds);
                if *is_expired {
                    self.request_submit();
                }
            }
            ServerMessage::ExamEvent { event, .. } if event == EVENT_TIME_EXPIRED => {
                self.request_submit();
            }
            _ => {}
        }
    }

    // ===== NAVIGATION =====

    pub fn go_to_question(&mut self, index: usize) {
        let max_index = self.question_count().saturating_sub(1);
        self.current_question_index = index.min(max_index);
    }

    pub fn next_question(&mut self) {
        if self.current_question_index + 1 < self.question_count() {
            self.current_question_index += 1;
        }
    }

    pub fn previous_question(&mut self) {
        self.current_question_index = self.current_question_index.saturating_sub(1);
    }

    pub fn current_question_index(&self) -> usize {
        self.current_question_index
    }

    pub fn current_question(&self) -> Option<&Question> {
        self.exam
            .as_ref()
            .and_then(|e| e.questions.get(self.current_question_index))
    }

    fn question_count(&self) -> usize {
        self.exam.as_ref().map_or(0, |e| e.questions.len())
    }

    // ===== TIMER =====

    pub fn time_remaining(&self) -> i64 {
        self.time_remaining_seconds
    }

    pub fn set_time_remaining(&mut self, seconds: i64) {
        self.time_remaining_seconds = seconds.max(0);
    }

    /// One-second tick. Reaching zero raises the submit request.
    pub fn decrement_time(&mut self) {
        if self.time_remaining_seconds > 0 {
            self.time_remaining_seconds -= 1;
            if self.time_remaining_seconds == 0 {
                self.request_submit();
            }
        }
    }

    pub fn sync_server_time(&mut self, server_time: DateTime<Utc>, time_remaining_seconds: i64) {
        self.server_time_offset_ms = (Utc::now() - server_time).num_milliseconds();
        self.set_time_remaining(time_remaining_seconds);
    }

    pub fn server_time_offset_ms(&self) -> i64 {
        self.server_time_offset_ms
    }

    /// `HH:MM:SS`.
    pub fn formatted_time(&self) -> String {
        let seconds = self.time_remaining_seconds.max(0);
        format!(
            "{:02}:{:02}:{:02}",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }

    pub fn is_low_time(&self) -> bool {
        self.time_remaining_seconds <= LOW_TIME_SECONDS
    }

    pub fn is_critical_time(&self) -> bool {
        self.time_remaining_seconds <= CRITICAL_TIME_SECONDS
    }

    // ===== CONNECTION & SYNC FLAGS =====

    pub fn set_connected(&mut self, connected: bool) {
        self.is_connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn set_syncing(&mut self, syncing: bool) {
        self.is_syncing = syncing;
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing
    }

    pub fn set_online(&mut self, online: bool) {
        self.is_online = online;
    }

    pub fn is_online(&self) -> bool {
        self.is_online
    }

    pub fn set_queued_checkpoints(&mut self, count: i64) {
        self.queued_checkpoints = count;
    }

    pub fn queued_checkpoints(&self) -> i64 {
        self.queued_checkpoints
    }

    pub fn update_last_sync_time(&mut self) {
        self.last_sync_time = Some(Utc::now());
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.last_sync_time
    }

    // ===== SUBMIT =====

    pub fn request_submit(&mut self) {
        if !self.submit_requested {
            tracing::info!("Submission requested");
        }
        self.submit_requested = true;
    }

    pub fn submit_requested(&self) -> bool {
        self.submit_requested
    }

    pub fn set_submitting(&mut self, submitting: bool) {
        self.is_submitting = submitting;
    }

    pub fn is_submitting(&self) -> bool {
        self.is_submitting
    }

    // ===== STATS =====

    pub fn progress(&self) -> ExamProgress {
        let questions = self.exam.as_ref().map(|e| e.questions.as_slice()).unwrap_or(&[]);
        let total = questions.len();
        let answered = questions
            .iter()
            .filter(|q| self.is_question_answered(q.id))
            .count();
        let flagged = questions
            .iter()
            .filter(|q| self.is_question_flagged(q.id))
            .count();
        let percentage = if total > 0 {
            answered as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        ExamProgress {
            total,
            answered,
            flagged,
            unanswered: total - answered,
            percentage,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
