//! State-transfer end-to-end tests.

use {
	crate::utils::{self, MemoryReceiver, timeout_ms, timeout_s, wait_until},
	bytes::Bytes,
	core::time::Duration,
	flock::*,
	std::collections::HashMap,
};

/// Stack with a failure-injection layer between the transport and the
/// reliable-delivery layer.
const DISCARD_STACK: &str =
	"loopback:discard:fifo:state-transfer:executor";

fn state_protocol(channel: &Channel) -> std::sync::Arc<StateTransfer> {
	channel
		.stack()
		.find_by_type::<StateTransfer>()
		.expect("stack has a state-transfer layer")
}

fn fifo_protocol(channel: &Channel) -> std::sync::Arc<Fifo> {
	channel
		.stack()
		.find_by_type::<Fifo>()
		.expect("stack has a fifo layer")
}

#[tokio::test]
async fn single_member_gets_null_state() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let c1 = utils::connect(&net, "single_member").await?;
	let receiver = MemoryReceiver::new();
	c1.set_receiver(receiver.clone());

	// resolves synthetically, well within a second
	let state = timeout_ms(1000, c1.get_state(None, Duration::from_secs(5)))
		.await
		.expect("no response within 1s")?;
	assert_eq!(state, None);

	// nothing went over the wire for this
	let proto = state_protocol(&c1);
	assert_eq!(proto.num_state_requests(), 0);
	assert_eq!(proto.num_bytes_sent(), 0);
	assert!(!proto.is_waiting_for_state_response());

	assert!(timeout_s(2, receiver.wait_for_installed_state(1)).await.is_ok());
	assert_eq!(receiver.installed_states(), vec![None]);

	Ok(())
}

#[tokio::test]
async fn two_member_transfer_carries_state_and_stats() -> anyhow::Result<()> {
	let net = LoopbackNet::new();

	let a = utils::connect(&net, "two_member").await?;
	a.set_receiver(MemoryReceiver::with_state(vec![0x01, 0x02, 0x03]));

	let b = utils::connect(&net, "two_member").await?;
	let receiver_b = MemoryReceiver::new();
	b.set_receiver(receiver_b.clone());

	let state = b.get_state(None, Duration::from_secs(5)).await?;
	assert_eq!(state, Some(Bytes::from(vec![0x01, 0x02, 0x03])));

	let provider = state_protocol(&a);
	assert_eq!(provider.num_state_requests(), 1);
	assert_eq!(provider.num_bytes_sent(), 3);
	assert!((provider.average_state_size() - 3.0).abs() < f64::EPSILON);

	// the requester's application saw the same bytes
	assert!(timeout_s(2, receiver_b.wait_for_installed_state(1)).await.is_ok());
	assert_eq!(
		receiver_b.installed_states(),
		vec![Some(Bytes::from(vec![0x01, 0x02, 0x03]))]
	);

	// the transfer machinery wound down
	let fifo_b = fifo_protocol(&b);
	assert_eq!(fifo_b.barrier_depth(), 0);
	assert!(!fifo_b.is_stability_suspended());
	assert!(fifo_b.stability_suspends() >= 1);
	assert!(!state_protocol(&b).is_waiting_for_state_response());

	Ok(())
}

#[tokio::test]
async fn provider_crash_returns_null_state() -> anyhow::Result<()> {
	let net = LoopbackNet::new();

	// A is the coordinator and will silently swallow state requests
	let a = utils::connect_with_stack(&net, "provider_crash", DISCARD_STACK)
		.await?;
	a.set_receiver(MemoryReceiver::with_state(vec![0xAA]));
	let discard = a
		.stack()
		.find_by_type::<Discard>()
		.expect("stack has a discard layer");
	discard.drop_up_matching(|msg| {
		matches!(
			msg.header(StateTransfer::ID),
			Some(Header::State(hdr))
				if hdr.kind == StateTransferKind::Request
		)
	});

	let b = utils::connect(&net, "provider_crash").await?;
	let _c = utils::connect(&net, "provider_crash").await?;

	let request = {
		let receiver = MemoryReceiver::new();
		b.set_receiver(receiver.clone());
		let b_get = b.get_state(None, Duration::from_secs(5));
		tokio::pin!(b_get);

		// the request must reach A (and be swallowed) before A dies
		let reached = tokio::select! {
			reached = wait_until(Duration::from_secs(2), || discard.discarded() >= 1) => reached,
			result = &mut b_get => {
				panic!("get_state resolved before the provider crashed: {result:?}")
			}
		};
		assert!(reached, "state request never reached the provider");

		a.close();
		b_get.await
	};

	// null state, promptly, and the requester is no longer waiting
	assert_eq!(request?, None);
	assert!(!state_protocol(&b).is_waiting_for_state_response());

	Ok(())
}

#[tokio::test]
async fn explicit_target_times_out_when_unresponsive() -> anyhow::Result<()> {
	let net = LoopbackNet::new();

	let a = utils::connect_with_stack(&net, "target_timeout", DISCARD_STACK)
		.await?;
	let discard = a.stack().find_by_type::<Discard>().unwrap();
	discard.drop_up_matching(|msg| msg.header(StateTransfer::ID).is_some());

	let b = utils::connect(&net, "target_timeout").await?;

	// a crashed explicit target is not recovered: the caller's timeout is
	// the only way out
	let result = b
		.get_state(a.address(), Duration::from_millis(300))
		.await;
	assert!(matches!(result, Err(ChannelError::StateTransferTimeout)));

	// the stability suspension expires on its own
	let fifo_b = fifo_protocol(&b);
	assert!(
		wait_until(Duration::from_secs(2), || !fifo_b.is_stability_suspended())
			.await
	);

	Ok(())
}

#[tokio::test]
async fn installed_digest_excludes_pre_state_multicasts() -> anyhow::Result<()>
{
	let net = LoopbackNet::new();

	let a = utils::connect(&net, "digest_floor").await?;
	let receiver_a = MemoryReceiver::new();
	a.set_receiver(receiver_a.clone());

	// five multicasts, folded into A's application state
	for i in 1..=5u8 {
		a.send(Message::multicast(Bytes::from(vec![i])))?;
	}
	assert!(timeout_s(5, receiver_a.wait_for_messages(5)).await.is_ok());
	receiver_a.set_local_state(vec![5u8]);

	let b = utils::connect(&net, "digest_floor").await?;
	let receiver_b = MemoryReceiver::new();
	b.set_receiver(receiver_b.clone());

	let state = b.get_state(None, Duration::from_secs(5)).await?;
	assert_eq!(state, Some(Bytes::from(vec![5u8])));

	// everything after the transfer flows; nothing below the digest does
	for i in 6..=8u8 {
		a.send(Message::multicast(Bytes::from(vec![i])))?;
	}
	assert!(timeout_s(5, receiver_b.wait_for_messages(3)).await.is_ok());
	let payloads: Vec<u8> =
		receiver_b.messages().iter().map(|m| m.payload()[0]).collect();
	assert_eq!(payloads, vec![6, 7, 8]);

	// the requester's digest sits past the provider's pre-state sends
	let digest = fifo_protocol(&b).digest();
	let floor = digest.get(&a.address().unwrap()).unwrap();
	assert!(floor.delivered >= 5, "digest too low: {digest}");

	Ok(())
}

#[tokio::test]
async fn flush_config_skips_digest_exchange() -> anyhow::Result<()> {
	let net = LoopbackNet::new();

	let a = utils::connect(&net, "flush_supported").await?;
	a.set_receiver(MemoryReceiver::with_state(vec![0x07]));

	// a flush layer would announce itself this way
	let mut config = HashMap::new();
	config.insert("flush_supported".to_owned(), "true".to_owned());
	a.stack().down(Event::Config(config.clone()));

	let b = utils::connect(&net, "flush_supported").await?;
	b.stack().down(Event::Config(config));

	let state = b.get_state(None, Duration::from_secs(5)).await?;
	assert_eq!(state, Some(Bytes::from(vec![0x07])));

	// no barrier was involved on the provider side
	assert_eq!(fifo_protocol(&a).barrier_depth(), 0);

	Ok(())
}
