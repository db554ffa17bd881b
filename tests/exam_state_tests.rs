// tests/exam_state_tests.rs

mod common;

use chrono::{Duration, Utc};
use common::{answer_record, sample_attempt, sample_exam};
use exam_checkpoint::{
    error::AppError,
    exam::ExamState,
    models::{
        answer::AnswerPayload,
        checkpoint::CheckpointAck,
        message::{EVENT_TIME_EXPIRED, ServerMessage},
    },
};

fn loaded() -> ExamState {
    let mut exam = sample_exam();
    exam.id = 3;
    exam.questions.reverse();
    let mut state = ExamState::new();
    state.load(exam, sample_attempt(11, 3));
    state
}

#[test]
fn load_orders_questions_and_sets_timer() {
    let state = loaded();
    let exam = state.exam().unwrap();
    let ids: Vec<i64> = exam.questions.iter().map(|q| q.id).collect();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    assert_eq!(state.time_remaining(), 5_400);
    assert_eq!(state.current_question().unwrap().id, 1);
}

#[test]
fn every_change_bumps_the_sequence() {
    let mut state = loaded();

    let first = state
        .set_answer(7, Some(AnswerPayload::choice("B")), 30)
        .unwrap();
    let second = state
        .set_answer(7, Some(AnswerPayload::choice("D")), 15)
        .unwrap();

    assert_eq!((first.attempt_id, first.question_id, first.sequence), (11, 7, 1));
    assert_eq!(second.sequence, 2);
    assert_eq!(second.answer, Some(AnswerPayload::choice("D")));
    assert_eq!(second.time_spent_seconds, 45);
    assert!(state.is_question_answered(7));
}

#[test]
fn rejects_unknown_question_and_wrong_shape() {
    let mut state = loaded();
    assert!(matches!(
        state.set_answer(99, Some(AnswerPayload::choice("A")), 1),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        state.set_answer(2, Some(AnswerPayload::choice("A")), 1),
        Err(AppError::BadRequest(_))
    ));
    assert!(matches!(
        ExamState::new().set_answer(1, None, 1),
        Err(AppError::BadRequest(_))
    ));
    state
        .set_answer(2, Some(AnswerPayload::Boolean { value: true }), 1)
        .unwrap();
}

#[test]
fn flag_keeps_answer_and_autosave_picks_it_up() {
    let mut state = loaded();
    state
        .set_answer(7, Some(AnswerPayload::choice("B")), 10)
        .unwrap();
    assert!(state.collect_deltas().unwrap().is_empty());

    state.flag_question(7, true);
    assert_eq!(state.answer(7).unwrap().sequence, 1);
    assert!(state.is_question_flagged(7));

    let deltas = state.collect_deltas().unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].sequence, 2);
    assert!(deltas[0].is_flagged);
    assert_eq!(deltas[0].answer, Some(AnswerPayload::choice("B")));

    assert!(state.collect_deltas().unwrap().is_empty());
}

#[test]
fn restored_unsynced_answers_are_pushed_again() {
    let mut state = loaded();
    let mut synced = answer_record(11, 4, "A", 3);
    synced.needs_sync = false;
    state.restore_answers(vec![synced, answer_record(11, 7, "D", 2)]);

    assert_eq!(state.acked_sequence(4), Some(3));
    assert_eq!(state.acked_sequence(7), None);

    let deltas = state.collect_deltas().unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!((deltas[0].question_id, deltas[0].sequence), (7, 3));
}

#[test]
fn server_messages_update_state() {
    let mut state = loaded();

    state.apply_server_message(&ServerMessage::Connected {
        attempt_id: 11,
        time_remaining_seconds: 1_000,
        server_time: None,
        heartbeat_interval: Some(30),
    });
    assert!(state.is_connected());
    assert_eq!(state.time_remaining(), 1_000);

    state.set_syncing(true);
    state.apply_server_message(&ServerMessage::CheckpointAck(CheckpointAck {
        question_id: 7,
        sequence: 4,
        saved_at: Utc::now(),
        time_remaining_seconds: 990,
    }));
    state.apply_server_message(&ServerMessage::CheckpointAck(CheckpointAck {
        question_id: 7,
        sequence: 2,
        saved_at: Utc::now(),
        time_remaining_seconds: 985,
    }));
    assert!(!state.is_syncing());
    assert_eq!(state.acked_sequence(7), Some(4));
    assert_eq!(state.time_remaining(), 985);
    assert!(state.last_sync_time().is_some());

    state.apply_server_message(&ServerMessage::TimeUpdate {
        server_time: Utc::now() - Duration::seconds(2),
        time_remaining_seconds: 500,
        elapsed_seconds: 4_900,
        is_expired: false,
    });
    assert_eq!(state.time_remaining(), 500);
    assert!(state.server_time_offset_ms() >= 2_000);
    assert!(state.is_low_time());
    assert!(!state.is_critical_time());
    assert!(!state.submit_requested());

    state.apply_server_message(&ServerMessage::ExamEvent {
        event: EVENT_TIME_EXPIRED.to_string(),
        data: None,
    });
    assert!(state.submit_requested());
}

#[test]
fn timer_formats_and_requests_submit_at_zero() {
    let mut state = loaded();
    state.set_time_remaining(3_725);
    assert_eq!(state.formatted_time(), "01:02:05");

    state.set_time_remaining(2);
    assert!(state.is_critical_time());
    state.decrement_time();
    assert!(!state.submit_requested());
    state.decrement_time();
    assert_eq!(state.time_remaining(), 0);
    assert!(state.submit_requested());
    state.decrement_time();
    assert_eq!(state.formatted_time(), "00:00:00");
}

#[test]
fn navigation_is_clamped() {
    let mut state = loaded();
    state.previous_question();
    assert_eq!(state.current_question_index(), 0);

    state.go_to_question(100);
    assert_eq!(state.current_question_index(), 9);
    state.next_question();
    assert_eq!(state.current_question_index(), 9);
    state.previous_question();
    assert_eq!(state.current_question().unwrap().id, 9);
}

#[test]
fn progress_counts_answered_and_flagged() {
    let mut state = loaded();
    state
        .set_answer(1, Some(AnswerPayload::choice("A")), 5)
        .unwrap();
    state
        .set_answer(3, Some(AnswerPayload::text("   ")), 5)
        .unwrap();
    state.flag_question(5, true);

    let progress = state.progress();
    assert_eq!(progress.total, 10);
    assert_eq!(progress.answered, 1);
    assert_eq!(progress.flagged, 1);
    assert_eq!(progress.unanswered, 9);
    assert!((progress.percentage - 10.0).abs() < f64::EPSILON);

    let submitted = state.submission_answers();
    assert_eq!(
        submitted.iter().map(|a| a.question_id).collect::<Vec<_>>(),
        vec![1, 3, 5]
    );

    state.reset();
    assert!(state.exam().is_none());
    assert_eq!(state.progress().total, 0);
}
