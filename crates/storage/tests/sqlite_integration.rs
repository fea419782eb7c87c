use chrono::Duration;
use live_core::lifecycle::LifecyclePolicy;
use live_core::model::{
    LiveSession, Question, RegistrationWrite, SessionDraft, SessionId, SessionPatch,
    SessionStatus, UserId, UserProfile,
};
use live_core::time::fixed_now;
use storage::repository::{
    AnswerRepository, AnswerSubmission, AnswerWrite, JoinWrite, ParticipantRepository,
    SessionFilter, SessionRepository, StorageError,
};
use storage::sqlite::SqliteRepository;

async fn repo(name: &str) -> SqliteRepository {
    let url = format!("sqlite:file:{name}?mode=memory&cache=shared");
    let repo = SqliteRepository::connect(&url).await.expect("connect");
    repo.migrate().await.expect("migrate");
    repo
}

fn build_session(level: &str, max: Option<u32>) -> LiveSession {
    LiveSession::create(
        SessionId::generate(),
        SessionDraft {
            name: "Reading drill".into(),
            description: Some("Timed comprehension".into()),
            level: level.into(),
            scheduled_start: fixed_now() + Duration::hours(1),
            duration_minutes: 30,
            questions: vec![
                Question::new("bank/1", 1),
                Question::new("bank/2", 2).with_weight(2),
                Question::new("bank/3", 0),
            ],
            max_participants: max,
            open_enrollment: false,
            allow_immediate: false,
        },
        fixed_now(),
        &LifecyclePolicy::default(),
    )
    .unwrap()
}

fn student(id: &str) -> UserProfile {
    UserProfile::student(UserId::new(id).unwrap(), id, format!("Student {id}"))
}

#[tokio::test]
async fn sqlite_roundtrips_session_definition() {
    let repo = repo("memdb_live_roundtrip").await;
    let session = build_session("b2", Some(10));
    repo.insert_session(&session).await.unwrap();

    let fetched = repo.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(fetched, session);

    assert!(matches!(
        repo.insert_session(&session).await,
        Err(StorageError::Conflict)
    ));
}

#[tokio::test]
async fn sqlite_filters_by_status_and_level() {
    let repo = repo("memdb_live_filter").await;
    let a = build_session("a1", None);
    let b = build_session("b1", None);
    repo.insert_session(&a).await.unwrap();
    repo.insert_session(&b).await.unwrap();
    assert!(
        repo.write_back_status(b.id(), SessionStatus::Scheduled, SessionStatus::Lobby)
            .await
            .unwrap()
    );

    let lobby = repo
        .list_sessions(&SessionFilter {
            status: Some(SessionStatus::Lobby),
            level: None,
        })
        .await
        .unwrap()
        .sessions;
    assert_eq!(lobby.len(), 1);
    assert_eq!(lobby[0].id(), b.id());

    let a1 = repo
        .list_sessions(&SessionFilter {
            status: None,
            level: Some("a1".into()),
        })
        .await
        .unwrap()
        .sessions;
    assert_eq!(a1.len(), 1);
    assert_eq!(a1[0].id(), a.id());
}

#[tokio::test]
async fn sqlite_update_is_optimistic() {
    let repo = repo("memdb_live_update").await;
    let session = build_session("c1", None);
    repo.insert_session(&session).await.unwrap();

    let mut edit = session.clone();
    edit.apply_patch(
        SessionPatch {
            duration_minutes: Some(45),
            ..SessionPatch::default()
        },
        fixed_now(),
        &LifecyclePolicy::default(),
    )
    .unwrap();
    assert_eq!(repo.update_session(&edit).await.unwrap(), 1);
    assert!(matches!(
        repo.update_session(&edit).await,
        Err(StorageError::Conflict)
    ));

    let stored = repo.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(stored.duration_minutes(), 45);
    assert_eq!(stored.revision(), 1);
}

#[tokio::test]
async fn sqlite_registration_enforces_cap_and_idempotence() {
    let repo = repo("memdb_live_register").await;
    let session = build_session("a2", Some(2));
    repo.insert_session(&session).await.unwrap();
    let at = fixed_now();

    assert_eq!(
        repo.register(session.id(), &student("s1"), at).await.unwrap(),
        RegistrationWrite::Registered
    );
    assert_eq!(
        repo.register(session.id(), &student("s1"), at).await.unwrap(),
        RegistrationWrite::AlreadyRegistered
    );
    assert_eq!(
        repo.register(session.id(), &student("s2"), at).await.unwrap(),
        RegistrationWrite::Registered
    );
    assert_eq!(
        repo.register(session.id(), &student("s3"), at).await.unwrap(),
        RegistrationWrite::CapacityExceeded { max: 2 }
    );
    assert_eq!(repo.list_registrations(session.id()).await.unwrap().len(), 2);

    assert!(repo.unregister(session.id(), &student("s1").user_id).await.unwrap());
    assert!(!repo.unregister(session.id(), &student("s1").user_id).await.unwrap());

    assert!(matches!(
        repo.register(SessionId::generate(), &student("s9"), at).await,
        Err(StorageError::NotFound)
    ));
}

#[tokio::test]
async fn sqlite_answers_are_first_write_wins() {
    let repo = repo("memdb_live_answers").await;
    let session = build_session("b2", None);
    repo.insert_session(&session).await.unwrap();
    repo.write_back_status(session.id(), SessionStatus::Scheduled, SessionStatus::Active)
        .await
        .unwrap();
    let user = student("s1");

    let joined = repo.join(session.id(), &user, fixed_now()).await.unwrap();
    assert!(matches!(joined, JoinWrite::Joined(_)));
    assert_eq!(joined.participant().unwrap().answers().len(), 3);

    let rejoined = repo
        .join(session.id(), &user, fixed_now() + Duration::minutes(5))
        .await
        .unwrap();
    assert!(matches!(rejoined, JoinWrite::AlreadyJoined(_)));
    assert_eq!(rejoined.participant().unwrap().joined_at(), fixed_now());

    let submit = |question_index, answer_index, points| AnswerSubmission {
        session_id: session.id(),
        user_id: user.user_id.clone(),
        question_index,
        answer_index,
        points,
        answered_at: fixed_now(),
    };

    assert_eq!(
        repo.record_answer(&submit(1, 2, 2)).await.unwrap(),
        AnswerWrite::Recorded { score: 2 }
    );
    assert_eq!(
        repo.record_answer(&submit(1, 0, 0)).await.unwrap(),
        AnswerWrite::AlreadyAnswered { score: 2 }
    );
    assert_eq!(
        repo.record_answer(&submit(7, 0, 0)).await.unwrap(),
        AnswerWrite::OutOfRange { slots: 3 }
    );

    let mut stranger = submit(0, 1, 1);
    stranger.user_id = UserId::new("nobody").unwrap();
    assert_eq!(
        repo.record_answer(&stranger).await.unwrap(),
        AnswerWrite::NotJoined
    );

    let participant = repo
        .get_participant(session.id(), &user.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(participant.answers(), &[None, Some(2), None]);
    assert_eq!(participant.score(), 2);
}

#[tokio::test]
async fn sqlite_cancel_and_delete() {
    let repo = repo("memdb_live_cancel").await;
    let session = build_session("b2", None);
    repo.insert_session(&session).await.unwrap();
    repo.write_back_status(session.id(), SessionStatus::Scheduled, SessionStatus::Lobby)
        .await
        .unwrap();
    repo.join(session.id(), &student("s1"), fixed_now()).await.unwrap();

    assert!(repo.cancel_session(session.id()).await.unwrap());
    assert!(!repo.cancel_session(session.id()).await.unwrap());
    let cancelled = repo.get_session(session.id()).await.unwrap().unwrap();
    assert!(cancelled.is_cancelled());
    assert_eq!(cancelled.cached_status(), SessionStatus::Cancelled);
    assert_eq!(cancelled.participant_count(), 1);

    repo.delete_session(session.id()).await.unwrap();
    assert!(repo.get_session(session.id()).await.unwrap().is_none());
    assert!(repo.list_participants(session.id()).await.unwrap().is_empty());
    assert!(matches!(
        repo.cancel_session(session.id()).await,
        Err(StorageError::NotFound)
    ));
}

#[tokio::test]
async fn sqlite_listing_skips_unreadable_rows() {
    let repo = repo("memdb_live_corrupt").await;
    let good = build_session("b2", None);
    let bad = build_session("b2", None);
    repo.insert_session(&good).await.unwrap();
    repo.insert_session(&bad).await.unwrap();
    sqlx::query("UPDATE live_sessions SET questions = 'not json' WHERE id = ?1")
        .bind(bad.id().to_string())
        .execute(repo.pool())
        .await
        .unwrap();

    let listing = repo.list_sessions(&SessionFilter::default()).await.unwrap();
    assert_eq!(listing.sessions.len(), 1);
    assert_eq!(listing.sessions[0].id(), good.id());
    assert_eq!(listing.unreadable.len(), 1);
    assert_eq!(listing.unreadable[0].id, bad.id().to_string());
    assert!(matches!(
        listing.unreadable[0].error,
        StorageError::Serialization(_)
    ));

    assert!(repo.get_session(good.id()).await.unwrap().is_some());
    assert!(matches!(
        repo.get_session(bad.id()).await,
        Err(StorageError::Serialization(_))
    ));
}

#[tokio::test]
async fn sqlite_listing_loads_memberships_per_session() {
    let repo = repo("memdb_live_batch").await;
    let first = build_session("c2", None);
    let second = build_session("c2", None);
    repo.insert_session(&first).await.unwrap();
    repo.insert_session(&second).await.unwrap();
    repo.register(first.id(), &student("s1"), fixed_now()).await.unwrap();
    repo.register(second.id(), &student("s2"), fixed_now()).await.unwrap();
    repo.register(second.id(), &student("s3"), fixed_now()).await.unwrap();
    repo.write_back_status(second.id(), SessionStatus::Scheduled, SessionStatus::Lobby)
        .await
        .unwrap();
    repo.join(second.id(), &student("s2"), fixed_now()).await.unwrap();

    let listing = repo.list_sessions(&SessionFilter::default()).await.unwrap();
    assert!(listing.unreadable.is_empty());
    for session in &listing.sessions {
        let fetched = repo.get_session(session.id()).await.unwrap().unwrap();
        assert_eq!(session, &fetched);
    }
    let by_id = |id| {
        listing
            .sessions
            .iter()
            .find(|s| s.id() == id)
            .unwrap()
    };
    assert_eq!(by_id(first.id()).registrations().len(), 1);
    assert_eq!(by_id(first.id()).participant_count(), 0);
    assert_eq!(by_id(second.id()).registrations().len(), 2);
    assert_eq!(by_id(second.id()).participant_count(), 1);
}

#[tokio::test]
async fn sqlite_writes_recheck_the_stored_session() {
    let repo = repo("memdb_live_closed").await;
    let session = build_session("b2", Some(5));
    repo.insert_session(&session).await.unwrap();
    let user = student("s1");

    assert_eq!(
        repo.join(session.id(), &user, fixed_now()).await.unwrap(),
        JoinWrite::Closed {
            status: SessionStatus::Scheduled
        }
    );

    repo.write_back_status(session.id(), SessionStatus::Scheduled, SessionStatus::Active)
        .await
        .unwrap();
    repo.join(session.id(), &user, fixed_now()).await.unwrap();
    assert!(repo.cancel_session(session.id()).await.unwrap());

    let answer = AnswerSubmission {
        session_id: session.id(),
        user_id: user.user_id.clone(),
        question_index: 0,
        answer_index: 1,
        points: 1,
        answered_at: fixed_now(),
    };
    assert_eq!(
        repo.record_answer(&answer).await.unwrap(),
        AnswerWrite::Closed {
            status: SessionStatus::Cancelled
        }
    );
    assert_eq!(
        repo.register(session.id(), &student("s2"), fixed_now())
            .await
            .unwrap(),
        RegistrationWrite::Closed {
            status: SessionStatus::Cancelled
        }
    );
    let participant = repo
        .get_participant(session.id(), &user.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(participant.score(), 0);
}

#[tokio::test]
async fn sqlite_update_guards_state_the_revision_misses() {
    let repo = repo("memdb_live_update_guard").await;
    let session = build_session("d1", None);
    repo.insert_session(&session).await.unwrap();
    let policy = LifecyclePolicy::default();

    let mut fewer_questions = session.clone();
    fewer_questions
        .apply_patch(
            SessionPatch {
                questions: Some(vec![Question::new("bank/9", 0)]),
                ..SessionPatch::default()
            },
            fixed_now(),
            &policy,
        )
        .unwrap();
    let mut tighter_cap = session.clone();
    tighter_cap
        .apply_patch(
            SessionPatch {
                max_participants: Some(Some(1)),
                ..SessionPatch::default()
            },
            fixed_now(),
            &policy,
        )
        .unwrap();

    repo.register(session.id(), &student("s1"), fixed_now()).await.unwrap();
    repo.register(session.id(), &student("s2"), fixed_now()).await.unwrap();
    assert!(matches!(
        repo.update_session(&tighter_cap).await,
        Err(StorageError::Conflict)
    ));

    repo.write_back_status(session.id(), SessionStatus::Scheduled, SessionStatus::Lobby)
        .await
        .unwrap();
    repo.join(session.id(), &student("s1"), fixed_now()).await.unwrap();
    assert!(matches!(
        repo.update_session(&fewer_questions).await,
        Err(StorageError::Conflict)
    ));

    let stored = repo.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(stored.questions().len(), 3);
    assert_eq!(stored.max_participants(), None);
    assert_eq!(stored.revision(), 0);
}
