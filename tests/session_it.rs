// self
use hiro_session::{
	_preludet::*,
	session::{
		EventSubscriptions, Frame, HookChannel, HookFuture, OpenHook, Session, SessionConfig,
		SessionConfigBuilder, SessionEndpoint, SessionState,
	},
	token::TokenManager,
};

const PROTOCOL: &str = "events-1.0.0";
const DATA: &str = r#"{"type":"CREATE","body":{"ogit/_id":"issue-1"}}"#;

fn config() -> SessionConfigBuilder {
	let url = Url::parse("ws://fake.local/api/events-ws/6").expect("Fixture URL should parse.");

	SessionConfig::builder(SessionEndpoint::Static { url, protocol: Some(PROTOCOL.into()) })
}

struct Harness {
	session: Session,
	transport: Arc<FakeChannelTransport>,
	listener: Arc<RecordingListener>,
	source: Arc<CountingSource>,
}

fn harness(config: SessionConfigBuilder) -> Harness {
	harness_with_hook(config, None)
}

fn harness_with_hook(config: SessionConfigBuilder, hook: Option<Arc<dyn OpenHook>>) -> Harness {
	let (tokens, source): (Arc<TokenManager>, _) = counting_manager();
	let transport = FakeChannelTransport::new();
	let listener = RecordingListener::new();
	let mut builder = Session::builder(config.build().expect("Session config should be valid."), tokens)
		.transport(transport.clone())
		.listener(listener.clone());

	if let Some(hook) = hook {
		builder = builder.open_hook(hook);
	}

	let session = builder.build().expect("Session should build with a fake transport.");

	Harness { session, transport, listener, source }
}

async fn running(harness: &Harness) -> FakePeer {
	harness.session.start().await.expect("Session should start.");

	let peer = harness.transport.next_peer().await.expect("A channel should be opened.");

	peer.send_text(DATA);

	assert!(wait_for_state(&harness.session, SessionState::Running).await);

	peer
}

#[tokio::test]
async fn start_presents_protocol_and_bearer_subprotocol() {
	let h = harness(config());

	h.session.start().await.expect("Session should start.");

	let peer = h.transport.next_peer().await.expect("A channel should be opened.");

	assert_eq!(peer.url.as_str(), "ws://fake.local/api/events-ws/6");
	assert_eq!(peer.protocols, vec![PROTOCOL.to_owned(), "token-token-1".to_owned()]);
	assert_eq!(h.session.state(), SessionState::RunningPreliminary);
	assert_eq!(h.listener.events(), vec![ListenerEvent::Open]);
	assert!(matches!(
		h.session.start().await,
		Err(Error::Session(hiro_session::error::SessionError::InvalidState { .. }))
	));
}

#[tokio::test]
async fn first_data_frame_promotes_to_running() {
	let h = harness(config());
	let peer = running(&h).await;

	peer.send_text(r#"{"type":"UPDATE","body":{}}"#);

	assert!(wait_until(|| h.listener.messages().len() == 2).await);
	assert_eq!(h.listener.messages()[0], DATA);
}

#[tokio::test]
async fn unauthorized_while_running_refreshes_once_then_reconnects() {
	let h = harness(config());
	let peer = running(&h).await;

	peer.send_text(r#"{"error":{"code":401,"message":"token expired"}}"#);

	let next = h.transport.next_peer().await.expect("The session should reconnect.");

	assert_eq!(next.protocols, vec![PROTOCOL.to_owned(), "token-token-2".to_owned()]);
	assert_eq!(h.source.acquisitions(), 2);
	assert!(wait_for_state(&h.session, SessionState::RunningPreliminary).await);
	assert_eq!(h.listener.count(&ListenerEvent::Open), 2);
	assert!(h.listener.errors().is_empty());
}

#[tokio::test]
async fn unauthorized_before_first_data_fails_without_refresh() {
	let h = harness(config());

	h.session.start().await.expect("Session should start.");

	let peer = h.transport.next_peer().await.expect("A channel should be opened.");

	peer.send_text(r#"{"error":{"code":401,"message":"token rejected"}}"#);

	assert!(wait_for_state(&h.session, SessionState::Failed).await);
	assert_eq!(h.source.acquisitions(), 1);
	assert_eq!(h.transport.opens(), 1);
	assert_eq!(h.listener.errors(), vec!["Unauthorized: token rejected.".to_owned()]);
}

#[tokio::test]
async fn other_remote_errors_are_reported_and_keep_the_channel() {
	let h = harness(config());
	let peer = running(&h).await;

	peer.send_text(r#"{"error":{"code":500,"message":"boom"}}"#);

	assert!(wait_until(|| !h.listener.errors().is_empty()).await);
	assert_eq!(h.listener.errors(), vec!["Remote error 500: boom.".to_owned()]);
	assert_eq!(h.session.state(), SessionState::Running);
	assert_eq!(h.transport.opens(), 1);
}

#[tokio::test]
async fn malformed_and_binary_frames_are_dropped() {
	let h = harness(config());
	let peer = running(&h).await;

	peer.send_text("{not json");
	peer.send_frame(Frame::Binary(vec![1, 2, 3]));
	peer.send_text(DATA);

	assert!(wait_until(|| h.listener.messages().len() == 2).await);
	assert!(h.listener.errors().is_empty());
	assert_eq!(h.session.state(), SessionState::Running);
}

#[tokio::test]
async fn fragmented_messages_are_reassembled() {
	let h = harness(config());
	let peer = running(&h).await;

	peer.send_frame(Frame::Text { data: r#"{"type":"CRE"#.into(), last: false });
	peer.send_frame(Frame::Text { data: r#"ATE","body":{}}"#.into(), last: true });

	assert!(wait_until(|| h.listener.messages().len() == 2).await);
	assert_eq!(h.listener.messages()[1], r#"{"type":"CREATE","body":{}}"#);
}

#[tokio::test]
async fn listener_failure_is_fatal_to_the_connection() {
	let h = harness(config());
	let peer = running(&h).await;

	h.listener.fail_on("{\"type\":\"poison\"}");
	peer.send_text("{\"type\":\"poison\"}");

	assert!(wait_for_state(&h.session, SessionState::Failed).await);
	assert_eq!(h.listener.errors().len(), 1);
	assert_eq!(h.transport.opens(), 1);
}

#[tokio::test]
async fn close_twice_sends_one_close_frame() {
	let h = harness(config().close_reason("bye now"));
	let mut peer = running(&h).await;
	let closing = tokio::spawn({
		let session = h.session.clone();

		async move { session.close().await }
	});

	assert_eq!(
		peer.next_frame().await,
		Some(Frame::Close(Some(hiro_session::session::CloseReason::normal("bye now"))))
	);

	peer.close();
	closing.await.expect("Close task should not panic.").expect("Close should succeed.");
	h.session.close().await.expect("Second close should be a no-op.");

	assert_eq!(h.session.state(), SessionState::Closed);
	assert!(!peer.drain().iter().any(|frame| matches!(frame, Frame::Close(_))));
	assert_eq!(h.listener.count(&ListenerEvent::Close), 1);
	assert!(matches!(
		h.session.send("late").await,
		Err(Error::Session(hiro_session::error::SessionError::NotConnected))
	));
}

#[tokio::test(start_paused = true)]
async fn close_without_peer_acknowledgement_times_out() {
	let h = harness(config().close_timeout(Duration::from_secs(2)));
	let mut peer = running(&h).await;

	h.session.close().await.expect("Close should complete after the timeout.");

	assert_eq!(h.session.state(), SessionState::Closed);
	assert!(matches!(peer.next_frame().await, Some(Frame::Close(_))));
}

#[tokio::test(start_paused = true)]
async fn peer_close_triggers_reconnect_with_backoff() {
	let h = harness(config());

	h.session.start().await.expect("Session should start.");

	let peer = h.transport.next_peer().await.expect("A channel should be opened.");
	let started = tokio::time::Instant::now();

	peer.close();

	assert!(wait_for_state(&h.session, SessionState::Restarting).await);

	let _next = h.transport.next_peer().await.expect("The session should reconnect.");

	assert!(started.elapsed() >= Duration::from_secs(1));
	assert!(wait_for_state(&h.session, SessionState::RunningPreliminary).await);
	assert_eq!(h.listener.count(&ListenerEvent::Open), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_delays_follow_the_backoff_schedule() {
	const LIMIT: Duration = Duration::from_secs(700);

	let h = harness(config());

	h.session.start().await.expect("Session should start.");

	let mut peer = h.transport.next_peer().await.expect("A channel should be opened.");
	let mut gaps = Vec::new();

	for _ in 0..16 {
		let opened = tokio::time::Instant::now();

		peer.close();
		peer = h.transport.next_peer_within(LIMIT).await.expect("The session should reconnect.");
		gaps.push(opened.elapsed());
	}

	let (steps, plateau) = gaps.split_at(15);
	let steps: Vec<u64> = steps.iter().map(Duration::as_secs).collect();

	assert_eq!(steps, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 20, 30, 40, 50, 60]);
	assert!((60..600).contains(&plateau[0].as_secs()), "{:?}", plateau[0]);

	// A processed data frame rewinds the schedule.
	peer.send_text(DATA);

	assert!(wait_for_state(&h.session, SessionState::Running).await);

	let opened = tokio::time::Instant::now();

	peer.close();

	let _next = h.transport.next_peer_within(LIMIT).await.expect("The session should reconnect.");

	assert!(opened.elapsed() < Duration::from_secs(1));
	assert_eq!(h.transport.opens(), 18);
}

#[tokio::test(start_paused = true)]
async fn reconnect_failure_marks_session_failed() {
	let h = harness(config());
	let peer = running(&h).await;

	h.transport.fail_next_opens(1);
	peer.fail();

	assert!(wait_for_state(&h.session, SessionState::Failed).await);
	assert_eq!(h.transport.opens(), 2);
	assert_eq!(h.listener.errors().len(), 1);

	h.session.start().await.expect("A failed session may be started again.");

	assert!(h.transport.next_peer().await.is_some());
	assert_eq!(h.session.state(), SessionState::RunningPreliminary);
}

#[tokio::test(start_paused = true)]
async fn close_wins_over_pending_reconnect() {
	let h = harness(config());

	h.session.start().await.expect("Session should start.");

	let peer = h.transport.next_peer().await.expect("A channel should be opened.");

	peer.fail();

	assert!(wait_for_state(&h.session, SessionState::Restarting).await);

	h.session.close().await.expect("Close during backoff should succeed.");
	tokio::time::sleep(Duration::from_secs(5)).await;

	assert_eq!(h.session.state(), SessionState::Closed);
	assert_eq!(h.transport.opens(), 1);
	assert_eq!(h.listener.count(&ListenerEvent::Close), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_send_retries_reconnect_in_background() {
	let h = harness(config().send_retries(1));
	let mut peer = running(&h).await;

	peer.stop_reading();

	let err = h.session.send("lost").await.expect_err("Writes to a dead channel should fail.");

	assert!(matches!(err, Error::Transport(_)));

	let mut next = h.transport.next_peer().await.expect("The session should reconnect.");

	assert!(wait_for_state(&h.session, SessionState::RunningPreliminary).await);

	h.session.send("after").await.expect("Sends should succeed on the new channel.");

	assert_eq!(next.next_text().await.as_deref(), Some("after"));
}

#[tokio::test(start_paused = true)]
async fn send_failures_without_reconnect_leave_state_alone() {
	let h = harness(config().send_retries(3).reconnect_on_failed_send(false));
	let mut peer = running(&h).await;
	let started = tokio::time::Instant::now();

	peer.stop_reading();

	let err = h.session.send("lost").await.expect_err("Every retry should fail on a dead channel.");

	assert!(matches!(err, Error::Transport(_)));
	// Retries wait 0, 1, and 2 seconds.
	assert!(started.elapsed() >= Duration::from_secs(3));
	assert_eq!(h.session.state(), SessionState::Running);
	assert_eq!(h.transport.opens(), 1);
	assert!(h.session.send("again").await.is_err());
}

#[tokio::test]
async fn pings_are_answered_with_pongs() {
	let h = harness(config());
	let mut peer = running(&h).await;

	peer.send_frame(Frame::Ping(vec![7, 7]));

	assert_eq!(peer.next_frame().await, Some(Frame::Pong(vec![7, 7])));
}

#[tokio::test(start_paused = true)]
async fn keepalive_pings_follow_the_interval() {
	let h = harness(config().ping_interval(Duration::from_secs(3)));
	let mut peer = running(&h).await;
	let started = tokio::time::Instant::now();

	assert_eq!(peer.next_frame().await, Some(Frame::Ping(Vec::new())));
	assert!(started.elapsed() >= Duration::from_secs(2));

	let first = tokio::time::Instant::now();

	assert_eq!(peer.next_frame().await, Some(Frame::Ping(Vec::new())));
	assert!(first.elapsed() >= Duration::from_secs(3));
}

#[tokio::test]
async fn oversized_messages_are_dropped() {
	let h = harness(config().max_message_size(64));
	let peer = running(&h).await;

	peer.send_text(format!(r#"{{"type":"CREATE","body":"{}"}}"#, "x".repeat(128)));
	peer.send_frame(Frame::Text { data: "x".repeat(40), last: false });
	peer.send_frame(Frame::Text { data: "x".repeat(40), last: true });
	peer.send_text(r#"{"type":"UPDATE","body":{}}"#);

	assert!(wait_until(|| h.listener.messages().len() == 2).await);
	assert_eq!(h.listener.messages()[1], r#"{"type":"UPDATE","body":{}}"#);
	assert!(h.listener.errors().is_empty());
	assert_eq!(h.session.state(), SessionState::Running);
}

#[tokio::test]
async fn event_subscriptions_are_sent_on_open() {
	let hook = EventSubscriptions::new()
		.with_filter("issues", "(element.ogit/_type = ogit/Automation/AutomationIssue)")
		.with_scope("ogit/Organization:acme");
	let h = harness_with_hook(config(), Some(Arc::new(hook)));

	h.session.start().await.expect("Session should start.");

	let mut peer = h.transport.next_peer().await.expect("A channel should be opened.");
	let register: Value = serde_json::from_str(&peer.next_text().await.expect("Register frame."))
		.expect("Register frame should be JSON.");
	let subscribe: Value = serde_json::from_str(&peer.next_text().await.expect("Subscribe frame."))
		.expect("Subscribe frame should be JSON.");

	assert_eq!(register["type"], "register");
	assert_eq!(register["args"]["filter-id"], "issues");
	assert_eq!(register["args"]["filter-type"], "jfilter");
	assert_eq!(subscribe["type"], "subscribe");
	assert_eq!(subscribe["args"]["scopeId"], "ogit/Organization:acme");
	assert_eq!(subscribe["id"].as_str().map(str::len), Some(16));
}

struct RejectingHook;
impl OpenHook for RejectingHook {
	fn on_open<'a>(&'a self, _channel: HookChannel<'a>) -> HookFuture<'a> {
		Box::pin(async { Err(Error::Protocol { reason: "subscription refused".into() }) })
	}
}

#[tokio::test]
async fn open_hook_failure_marks_session_failed() {
	let h = harness_with_hook(config(), Some(Arc::new(RejectingHook)));
	let err = h.session.start().await.expect_err("A failing hook should fail the start.");

	assert!(matches!(err, Error::Session(hiro_session::error::SessionError::OpenHook { .. })));
	assert_eq!(h.session.state(), SessionState::Failed);
	assert_eq!(h.listener.errors().len(), 1);
	assert_eq!(h.listener.count(&ListenerEvent::Open), 0);
}
