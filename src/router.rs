use log::{debug, info, warn};

use crate::codec::TopicKind;
use crate::config::Variant;
use crate::mqtt::Transport;

const SINGLE_KINDS: &[TopicKind] = &[TopicKind::Status, TopicKind::Heartbeat];
const MULTI_KINDS: &[TopicKind] = &[TopicKind::Status, TopicKind::Distance, TopicKind::Online];

/// Trimmed id, or `default_id` when nothing is left.
pub fn sanitise_id(raw: &str, default_id: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        default_id.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Maps bay ids onto `{namespace}/{id}/{leaf}` topics, keeps the broker
/// subscriptions in line with the bay(s) being followed, and sends inbound
/// topics back to the bay they belong to.
///
/// Also owns the retain-warning and subscription-error flags. The retain timer
/// itself lives with the event loop; the router only records its outcome.
#[derive(Debug)]
pub struct TopicRouter {
    namespace: String,
    variant: Variant,
    default_id: String,
    current_id: String,
    tracked: Vec<String>,
    subscribed: Vec<String>,
    retain_warning: bool,
    subscription_error: Option<String>,
}

impl TopicRouter {
    pub fn new(namespace: &str, variant: Variant, default_id: &str, tracked: Vec<String>) -> Self {
        TopicRouter {
            namespace: namespace.trim_end_matches('/').to_string(),
            variant,
            default_id: default_id.to_string(),
            current_id: default_id.to_string(),
            tracked,
            subscribed: Vec::new(),
            retain_warning: false,
            subscription_error: None,
        }
    }

    pub fn retain_warning(&self) -> bool {
        self.retain_warning
    }

    pub fn subscription_error(&self) -> Option<&str> {
        self.subscription_error.as_deref()
    }

    pub fn topic(&self, id: &str, kind: TopicKind) -> String {
        format!("{}/{}/{}", self.namespace, id, kind.leaf())
    }

    fn kinds(&self) -> &'static [TopicKind] {
        match self.variant {
            Variant::Single => SINGLE_KINDS,
            Variant::Multi => MULTI_KINDS,
        }
    }

    fn wanted_topics(&self) -> Vec<String> {
        let ids: Vec<&str> = match self.variant {
            Variant::Single => vec![self.current_id.as_str()],
            Variant::Multi => self.tracked.iter().map(String::as_str).collect(),
        };
        ids.into_iter()
            .flat_map(|id| self.kinds().iter().map(move |kind| self.topic(id, *kind)))
            .collect()
    }

    /// (Re)subscribes the topics of the followed bay(s). Returns false when
    /// the request could not be issued; the error flag is raised and routing
    /// keeps working for whatever the broker still delivers.
    pub fn subscribe<T: Transport>(&mut self, transport: &mut T) -> bool {
        let topics = self.wanted_topics();
        self.retain_warning = false;
        let result = transport.subscribe(&topics);
        self.subscribed = topics;
        match result {
            Ok(()) => {
                info!("Subscribed to {:?}", self.subscribed);
                self.subscription_error = None;
                true
            }
            Err(err) => {
                self.record_subscription_error(err.to_string());
                false
            }
        }
    }

    fn unsubscribe<T: Transport>(&mut self, transport: &mut T) {
        if self.subscribed.is_empty() {
            return;
        }
        if let Err(err) = transport.unsubscribe(&self.subscribed) {
            warn!("Failed to unsubscribe from {:?}: {}", self.subscribed, err);
        }
        self.subscribed.clear();
    }

    /// Hands over the current subscriptions for teardown. Nothing is routed
    /// afterwards.
    pub fn take_subscriptions(&mut self) -> Vec<String> {
        std::mem::take(&mut self.subscribed)
    }

    /// Follows a different bay. Returns the sanitised new id, or `None` when
    /// nothing changed. Subscriptions are only touched while `connected`;
    /// otherwise they are renewed on the next connect.
    pub fn switch_to<T: Transport>(
        &mut self,
        transport: &mut T,
        raw_id: &str,
        connected: bool,
    ) -> Option<String> {
        if self.variant == Variant::Multi {
            warn!("Ignoring switch to {:?}: every tracked bay is followed", raw_id);
            return None;
        }
        let next = sanitise_id(raw_id, &self.default_id);
        if next == self.current_id {
            return None;
        }
        info!("Switching from {} to {}", self.current_id, next);

        if connected {
            self.unsubscribe(transport);
            self.current_id = next.clone();
            self.subscribe(transport);
        } else {
            self.subscribed.clear();
            self.current_id = next.clone();
            self.retain_warning = false;
        }
        Some(next)
    }

    /// Bay id and topic kind for a subscribed topic; anything else is `None`.
    pub fn route(&self, topic: &str) -> Option<(String, TopicKind)> {
        if !self.subscribed.iter().any(|known| known == topic) {
            return None;
        }
        let rest = topic.strip_prefix(&self.namespace)?.strip_prefix('/')?;
        let (id, leaf) = rest.rsplit_once('/')?;
        let kind = self.kinds().iter().find(|kind| kind.leaf() == leaf)?;
        Some((id.to_string(), *kind))
    }

    pub fn message_received(&mut self) {
        if self.retain_warning {
            debug!("Retained data arrived, clearing retain warning");
        }
        self.retain_warning = false;
    }

    pub fn raise_retain_warning(&mut self) {
        warn!(
            "No message on {:?} since subscribing; publishers may not be retaining",
            self.subscribed
        );
        self.retain_warning = true;
    }

    pub fn record_subscription_error(&mut self, cause: String) {
        warn!("Could not subscribe to MQTT topics: {}", cause);
        self.subscription_error = Some(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::{Call, FakeTransport};

    fn single() -> TopicRouter {
        TopicRouter::new("parking", Variant::Single, "bay-01", Vec::new())
    }

    #[test]
    fn test_single_topics() {
        let mut transport = FakeTransport::default();
        let mut router = single();
        assert!(router.subscribe(&mut transport));
        assert_eq!(
            transport.calls(),
            vec![Call::Subscribe(vec![
                "parking/bay-01/status".to_string(),
                "parking/bay-01/heartbeat".to_string(),
            ])]
        );
        assert_eq!(
            router.route("parking/bay-01/heartbeat"),
            Some(("bay-01".to_string(), TopicKind::Heartbeat))
        );
    }

    #[test]
    fn test_multi_topics_cover_every_tracked_bay() {
        let mut transport = FakeTransport::default();
        let mut router = TopicRouter::new(
            "parking/space/",
            Variant::Multi,
            "A1",
            vec!["A1".to_string(), "A2".to_string()],
        );
        router.subscribe(&mut transport);
        let Call::Subscribe(topics) = &transport.calls()[0] else {
            panic!("expected a subscribe call");
        };
        assert_eq!(topics.len(), 6);
        assert!(topics.contains(&"parking/space/A2/online".to_string()));
        assert_eq!(
            router.route("parking/space/A2/distance"),
            Some(("A2".to_string(), TopicKind::Distance))
        );
        assert_eq!(router.route("parking/space/A2/heartbeat"), None);
    }

    #[test]
    fn test_unknown_topics_are_not_routed() {
        let mut transport = FakeTransport::default();
        let mut router = single();
        router.subscribe(&mut transport);
        assert_eq!(router.route("parking/bay-02/status"), None);
        assert_eq!(router.route("other/bay-01/status"), None);
        assert_eq!(router.route("parking/bay-01"), None);
    }

    #[test]
    fn test_switch_resubscribes() {
        let mut transport = FakeTransport::default();
        let mut router = single();
        router.subscribe(&mut transport);

        assert_eq!(
            router.switch_to(&mut transport, "  bay-07 ", true),
            Some("bay-07".to_string())
        );
        assert_eq!(
            transport.calls()[1..],
            [
                Call::Unsubscribe(vec![
                    "parking/bay-01/status".to_string(),
                    "parking/bay-01/heartbeat".to_string(),
                ]),
                Call::Subscribe(vec![
                    "parking/bay-07/status".to_string(),
                    "parking/bay-07/heartbeat".to_string(),
                ]),
            ]
        );
        assert_eq!(router.route("parking/bay-01/status"), None);
        assert!(router.route("parking/bay-07/status").is_some());
    }

    #[test]
    fn test_switch_to_same_or_blank_id() {
        let mut transport = FakeTransport::default();
        let mut router = single();
        assert_eq!(router.switch_to(&mut transport, "bay-01", true), None);
        assert_eq!(router.switch_to(&mut transport, "   ", true), None);
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn test_switch_while_offline_defers_subscription() {
        let mut transport = FakeTransport::default();
        let mut router = single();
        router.switch_to(&mut transport, "bay-03", false);
        assert!(transport.calls().is_empty());
        router.subscribe(&mut transport);
        assert_eq!(
            transport.calls(),
            vec![Call::Subscribe(vec![
                "parking/bay-03/status".to_string(),
                "parking/bay-03/heartbeat".to_string(),
            ])]
        );
    }

    #[test]
    fn test_subscription_failure_raises_flag() {
        let mut transport = FakeTransport::default();
        transport.fail_subscriptions(true);
        let mut router = single();
        assert!(!router.subscribe(&mut transport));
        assert!(router.subscription_error().is_some());
        assert!(router.route("parking/bay-01/status").is_some());

        transport.fail_subscriptions(false);
        assert!(router.subscribe(&mut transport));
        assert_eq!(router.subscription_error(), None);
    }

    #[test]
    fn test_retain_warning_flag() {
        let mut transport = FakeTransport::default();
        let mut router = single();
        router.subscribe(&mut transport);
        router.raise_retain_warning();
        assert!(router.retain_warning());
        router.message_received();
        assert!(!router.retain_warning());

        router.raise_retain_warning();
        router.subscribe(&mut transport);
        assert!(!router.retain_warning());
    }

    #[test]
    fn test_take_subscriptions_stops_routing() {
        let mut transport = FakeTransport::default();
        let mut router = single();
        router.subscribe(&mut transport);
        assert_eq!(
            router.take_subscriptions(),
            vec!["parking/bay-01/status", "parking/bay-01/heartbeat"]
        );
        assert_eq!(router.route("parking/bay-01/status"), None);
        assert!(router.take_subscriptions().is_empty());
    }
}
