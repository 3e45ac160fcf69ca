//! Channel facade lifecycle and delivery tests.

use {
	crate::utils::{self, MemoryReceiver, timeout_s, wait_until},
	bytes::Bytes,
	core::time::Duration,
	flock::*,
};

#[tokio::test]
async fn basic_operations() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let c1 = utils::connect(&net, "basic_operations").await?;

	assert!(c1.is_open());
	assert!(c1.is_connected());
	assert!(c1.address().is_some());
	let view = c1.view().expect("connected channel has a view");
	assert!(view.contains(&c1.address().unwrap()));

	// connecting twice is a no-op
	c1.connect("basic_operations").await?;

	c1.disconnect();
	assert!(!c1.is_connected());
	assert!(c1.is_open());
	assert!(c1.address().is_none());
	assert!(c1.view().is_none());
	assert!(c1.cluster_name().is_none());

	// reconnect after disconnect
	c1.connect("basic_operations").await?;
	assert!(c1.is_connected());

	c1.close();
	assert!(!c1.is_open());
	assert!(!c1.is_connected());
	assert!(matches!(
		c1.connect("basic_operations").await,
		Err(ChannelError::Closed)
	));
	assert!(matches!(
		c1.send(Message::multicast(Bytes::new())),
		Err(ChannelError::Closed)
	));

	Ok(())
}

#[tokio::test]
async fn members_see_each_other() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let c1 = utils::connect(&net, "members_see_each_other").await?;
	let c2 = utils::connect(&net, "members_see_each_other").await?;

	let a1 = c1.address().unwrap();
	let a2 = c2.address().unwrap();

	assert!(
		wait_until(Duration::from_secs(2), || {
			c1.view().is_some_and(|v| v.contains(&a1) && v.contains(&a2))
		})
		.await
	);
	let view = c1.view().unwrap();
	assert_eq!(view.coordinator(), Some(a1));

	c2.close();
	assert!(
		wait_until(Duration::from_secs(2), || {
			c1.view().is_some_and(|v| !v.contains(&a2))
		})
		.await
	);

	Ok(())
}

#[tokio::test]
async fn view_ids_are_monotonic() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let receiver = MemoryReceiver::new();
	let c1 = utils::connect(&net, "view_ids_are_monotonic").await?;
	c1.set_receiver(receiver.clone());

	let c2 = utils::connect(&net, "view_ids_are_monotonic").await?;
	let c3 = utils::connect(&net, "view_ids_are_monotonic").await?;
	c3.close();
	c2.close();

	assert!(
		wait_until(Duration::from_secs(2), || receiver.views().len() >= 3).await
	);
	let views = receiver.views();
	for pair in views.windows(2) {
		assert!(pair[1].id > pair[0].id, "views must grow: {views:?}");
	}

	Ok(())
}

#[tokio::test]
async fn no_view_is_received_after_disconnect() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let c1 = utils::connect(&net, "no_view_after_disconnect").await?;
	let c2 = utils::connect(&net, "no_view_after_disconnect").await?;

	let receiver = MemoryReceiver::new();
	c2.set_receiver(receiver.clone());

	c2.disconnect();
	let seen = receiver.views().len();

	// membership keeps changing without c2
	let c3 = utils::connect(&net, "no_view_after_disconnect").await?;
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(receiver.views().len(), seen, "view delivered after disconnect");

	drop(c3);
	drop(c1);
	Ok(())
}

#[tokio::test]
async fn multicasts_are_delivered_in_order() -> anyhow::Result<()> {
	const NUM: usize = 100;

	let net = LoopbackNet::new();
	let c1 = utils::connect(&net, "ordering").await?;
	let receiver = MemoryReceiver::new();
	c1.set_receiver(receiver.clone());

	for i in 0..NUM {
		c1.send(Message::multicast(Bytes::from(vec![i as u8])))?;
	}

	assert!(timeout_s(5, receiver.wait_for_messages(NUM)).await.is_ok());
	let payloads: Vec<u8> =
		receiver.messages().iter().map(|m| m.payload()[0]).collect();
	let expected: Vec<u8> = (0..NUM as u8).collect();
	assert_eq!(payloads, expected);

	Ok(())
}

#[tokio::test]
async fn send_requires_a_connection() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let c1 = Channel::new(&net)?;
	assert!(matches!(
		c1.send(Message::multicast(Bytes::new())),
		Err(ChannelError::NotConnected)
	));
	Ok(())
}

#[tokio::test]
async fn get_state_without_state_protocol_is_rejected() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let c1 =
		utils::connect_with_stack(&net, "no_state_proto", "loopback:fifo:executor")
			.await?;
	assert!(matches!(
		c1.get_state(None, Duration::from_secs(1)).await,
		Err(ChannelError::NoStateProtocol)
	));
	Ok(())
}

#[tokio::test]
async fn duplicate_state_transfer_protocols_are_fatal() {
	let net = LoopbackNet::new();
	let result = Channel::with_stack(
		&net,
		"loopback:fifo:state-transfer:state-transfer:executor",
	);
	assert!(matches!(
		result,
		Err(ChannelError::Stack(StackError::DuplicateStateTransfer))
	));
}

#[tokio::test]
async fn missing_required_service_is_fatal() {
	let net = LoopbackNet::new();
	// no fifo layer: nothing below state-transfer answers GetDigest
	let result = Channel::with_stack(&net, "loopback:state-transfer");
	assert!(matches!(
		result,
		Err(ChannelError::Stack(StackError::MissingService { .. }))
	));
}

#[tokio::test]
async fn unknown_protocols_and_properties_are_fatal() {
	let net = LoopbackNet::new();
	assert!(matches!(
		Channel::with_stack(&net, "loopback:frobnicator"),
		Err(ChannelError::Config(ConfigError::UnknownProtocol(_)))
	));
	assert!(matches!(
		Channel::with_stack(&net, "loopback:fifo(bogus=1)"),
		Err(ChannelError::Config(ConfigError::UnknownProperty { .. }))
	));
}
