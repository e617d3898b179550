//! Static tables translating wire event names into public ones.
//!
//! A domain layer registers one listener per table through
//! [`Session::on_mapped`](crate::Session::on_mapped) and re-emits under the
//! public name. Lookups are pure.

/// Ordered `(internal, public)` event name pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMapping {
    entries: &'static [(&'static str, &'static str)],
}

impl EventMapping {
    pub const fn new(entries: &'static [(&'static str, &'static str)]) -> Self {
        Self { entries }
    }

    pub fn public_name(&self, internal: &str) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(i, _)| *i == internal)
            .map(|(_, p)| *p)
    }

    pub fn internal_name(&self, public: &str) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(_, p)| *p == public)
            .map(|(i, _)| *i)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Room push events surfaced by the chat layer.
pub const CHAT_EVENTS: EventMapping = EventMapping::new(&[
    ("room_event", "room_event"),
    ("new_room_created", "new_room_created"),
    ("joined_to_room", "joined_to_room"),
    ("room_updated", "room_updated"),
]);

#[cfg(test)]
mod tests {
    use super::*;

    const RENAMED: EventMapping =
        EventMapping::new(&[("srv_msg", "message_received"), ("srv_typing", "set_typing")]);

    #[test]
    fn chat_table_covers_room_events() {
        assert_eq!(CHAT_EVENTS.len(), 4);
        assert_eq!(CHAT_EVENTS.public_name("room_updated"), Some("room_updated"));
        assert_eq!(CHAT_EVENTS.public_name("get_messages"), None);
    }

    #[test]
    fn lookups_go_both_ways() {
        assert_eq!(RENAMED.public_name("srv_msg"), Some("message_received"));
        assert_eq!(RENAMED.internal_name("set_typing"), Some("srv_typing"));
        assert_eq!(RENAMED.internal_name("srv_typing"), None);
    }

    #[test]
    fn iteration_keeps_table_order() {
        let internal: Vec<_> = RENAMED.iter().map(|(i, _)| i).collect();
        assert_eq!(internal, vec!["srv_msg", "srv_typing"]);
    }
}
