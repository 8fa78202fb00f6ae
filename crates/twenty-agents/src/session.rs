//! Channel plumbing shared by every agent loop

use std::time::Duration;
use tracing::{debug, info, warn};
use twenty_bridge::{Channel, Delivery, Endpoint};
use twenty_core::{Envelope, Message, PlayerId, Result, Role};

/// Wait until the coordinator invites this endpoint to `game_channel`
pub async fn join_game<E: Endpoint>(
    endpoint: &E,
    game_channel: &str,
    poll: Duration,
) -> Result<E::Channel> {
    info!("{} waiting for invitation to {}", endpoint.local_name(), game_channel);
    loop {
        match endpoint.accept_invitation(poll).await? {
            Some(channel) if channel.name() == game_channel => {
                info!("{} joined {}", endpoint.local_name(), game_channel);
                return Ok(channel);
            }
            Some(other) => {
                debug!("Ignoring invitation to {}", other.name());
            }
            None => continue,
        }
    }
}

/// Stamp and publish one message
pub async fn publish<C: Channel + ?Sized>(channel: &C, message: Message) -> Result<()> {
    let kind = message.kind();
    let bytes = Envelope::new(message).encode()?;
    channel.publish(bytes).await?;
    debug!("Published {} on {}", kind, channel.name());
    Ok(())
}

/// Publish `message`, retrying transient failures every `retry` until it
/// goes through. The envelope is encoded once, so a retried send carries the
/// same bytes and the receiver's digest dedup still applies.
pub async fn publish_retrying<C: Channel + ?Sized>(
    channel: &C,
    message: Message,
    retry: Duration,
) -> Result<()> {
    let kind = message.kind();
    let bytes = Envelope::new(message).encode()?;
    let mut attempt = 1u32;
    loop {
        match channel.publish(bytes.clone()).await {
            Ok(()) => {
                debug!("Published {} on {}", kind, channel.name());
                return Ok(());
            }
            Err(e) if e.is_transient() => {
                warn!(
                    "Publishing {} on {} failed (attempt {}): {}; retrying",
                    kind,
                    channel.name(),
                    attempt,
                    e
                );
                attempt += 1;
                tokio::time::sleep(retry).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Next decodable envelope, if one arrives within `poll`.
///
/// Malformed payloads are dropped. Transient channel errors pause for
/// `retry` and report nothing; other errors end the loop.
pub async fn next_envelope<C: Channel + ?Sized>(
    channel: &C,
    poll: Duration,
    retry: Duration,
) -> Result<Option<(Delivery, Envelope)>> {
    match channel.receive(poll).await {
        Ok(Some(delivery)) => match Envelope::decode(&delivery.payload) {
            Ok(envelope) => Ok(Some((delivery, envelope))),
            Err(e) => {
                warn!("Dropping malformed payload from {}: {}", delivery.source, e);
                Ok(None)
            }
        },
        Ok(None) => Ok(None),
        Err(e) if e.is_transient() => {
            warn!("Receive on {} failed: {}; retrying", channel.name(), e);
            tokio::time::sleep(retry).await;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Whether a transport source name belongs to the coordinator
pub fn from_coordinator(source: &str) -> bool {
    PlayerId::role_hint(source) == Some(Role::Coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Faults, FlakyChannel};
    use twenty_bridge::Hub;

    #[test]
    fn test_coordinator_sources() {
        assert!(from_coordinator("coordinator"));
        assert!(from_coordinator("school/classroom/coordinator"));
        assert!(!from_coordinator("guesser-Bob"));
        assert!(!from_coordinator("thinker-Alice"));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let hub = Hub::new();
        let coord = hub.connect("coordinator");
        let bob = hub.connect("guesser-Bob");
        let game = coord.create_channel("game").await.unwrap();
        game.invite("guesser-Bob").await.unwrap();
        let joined = join_game(&bob, "game", Duration::from_millis(50)).await.unwrap();

        game.publish(b"garbage".to_vec()).await.unwrap();
        publish(&game, Message::Guess { guess: "kite".into() }).await.unwrap();

        let poll = Duration::from_millis(50);
        let first = next_envelope(&joined, poll, poll).await;
        assert!(tokio_test::assert_ok!(first).is_none());
        let (delivery, envelope) = next_envelope(&joined, poll, poll).await.unwrap().unwrap();
        assert_eq!(delivery.source, "coordinator");
        assert_eq!(envelope.message.kind(), "guess");
    }

    #[tokio::test]
    async fn test_join_ignores_other_invitations() {
        let hub = Hub::new();
        let coord = hub.connect("coordinator");
        let bob = hub.connect("guesser-Bob");
        let lobby = coord.create_channel("lobby").await.unwrap();
        lobby.invite("guesser-Bob").await.unwrap();
        let game = coord.create_channel("game").await.unwrap();
        game.invite("guesser-Bob").await.unwrap();

        let joined = join_game(&bob, "game", Duration::from_millis(50)).await;
        assert_eq!(tokio_test::assert_ok!(joined).name(), "game");
    }

    #[tokio::test]
    async fn test_publish_retries_transient_failures() {
        let hub = Hub::new();
        let coord = hub.connect("coordinator");
        let bob = hub.connect("guesser-Bob");
        let game = coord.create_channel("game").await.unwrap();
        game.invite("guesser-Bob").await.unwrap();
        let joined = join_game(&bob, "game", Duration::from_millis(50)).await.unwrap();

        let faults = Faults::new();
        faults.fail_publishes("guess", 2);
        let flaky = FlakyChannel::new(joined, faults.clone());
        let sent = publish_retrying(
            &flaky,
            Message::Guess { guess: "kite".into() },
            Duration::from_millis(10),
        )
        .await;
        tokio_test::assert_ok!(sent);
        assert_eq!(faults.publish_attempts(), 3);

        let poll = Duration::from_millis(50);
        let (_, envelope) = next_envelope(&game, poll, poll).await.unwrap().unwrap();
        assert_eq!(envelope.message.kind(), "guess");
        assert!(next_envelope(&game, poll, poll).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_receive_error_pauses_then_continues() {
        let hub = Hub::new();
        let coord = hub.connect("coordinator");
        let bob = hub.connect("guesser-Bob");
        let game = coord.create_channel("game").await.unwrap();
        game.invite("guesser-Bob").await.unwrap();
        let joined = join_game(&bob, "game", Duration::from_millis(50)).await.unwrap();
        publish(&game, Message::Guess { guess: "kite".into() }).await.unwrap();

        let faults = Faults::new();
        faults.fail_receives(1);
        let flaky = FlakyChannel::new(joined, faults);
        let poll = Duration::from_millis(50);
        assert!(next_envelope(&flaky, poll, poll).await.unwrap().is_none());
        let (_, envelope) = next_envelope(&flaky, poll, poll).await.unwrap().unwrap();
        assert_eq!(envelope.message.kind(), "guess");
    }
}
