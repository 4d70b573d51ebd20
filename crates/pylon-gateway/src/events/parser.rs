//! Event parsing
//!
//! Canonicalizes dispatch event names before they reach the dispatcher.
//! The domain model layer is external to this crate: events whose names
//! are registered pass through with their raw payload for downstream
//! deserialization, and unregistered events are forwarded as-is rather
//! than rejected.

use serde_json::Value;

/// Canonical event names this client knows about.
const REGISTERED_EVENTS: &[&str] = &[
    // Gateway lifecycle
    "hello",
    "ready",
    "resumed",
    "invalid_session",
    // Channels
    "channel_create",
    "channel_update",
    "channel_delete",
    "channel_pins_update",
    // Guilds
    "guild_create",
    "guild_update",
    "guild_delete",
    "guild_ban_add",
    "guild_ban_remove",
    "guild_emojis_update",
    "guild_integrations_update",
    "guild_member_add",
    "guild_member_remove",
    "guild_member_update",
    "guild_members_chunk",
    "guild_role_create",
    "guild_role_update",
    "guild_role_delete",
    // Messages
    "message_create",
    "message_update",
    "message_delete",
    "message_delete_bulk",
    "message_reaction_add",
    "message_reaction_remove",
    "message_reaction_remove_all",
    // Presence and typing
    "presence_update",
    "typing_start",
    // Voice
    "voice_state_update",
    "voice_server_update",
    // Webhooks
    "webhooks_update",
];

/// Resolve a friendly alias to its canonical wire event name.
///
/// Applied consistently at subscribe time and at emit lookup time, so
/// either name addresses the same subscription list.
#[must_use]
pub fn resolve_alias(event: &str) -> &str {
    match event {
        "message" => "message_create",
        "member_add" => "guild_member_add",
        "member_remove" | "kick" => "guild_member_remove",
        "ban" => "guild_ban_add",
        "unban" => "guild_ban_remove",
        "typing" => "typing_start",
        other => other,
    }
}

/// Whether a canonical event name has a registered parser.
#[must_use]
pub fn is_registered(event: &str) -> bool {
    REGISTERED_EVENTS.contains(&event)
}

/// Turn a raw dispatch `(event_name, payload)` into its canonical form.
///
/// Never fails: an unregistered name is passed through untouched so
/// application code can still observe it.
#[must_use]
pub fn parse_event(event: &str, payload: Value) -> (String, Value) {
    let canonical = resolve_alias(&event.to_lowercase()).to_string();
    if !is_registered(&canonical) {
        tracing::trace!(event = %canonical, "No parser registered for event, forwarding raw payload");
    }
    (canonical, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_resolve_to_canonical_names() {
        assert_eq!(resolve_alias("message"), "message_create");
        assert_eq!(resolve_alias("kick"), "guild_member_remove");
        assert_eq!(resolve_alias("member_remove"), "guild_member_remove");
        assert_eq!(resolve_alias("ban"), "guild_ban_add");
        assert_eq!(resolve_alias("unban"), "guild_ban_remove");
        assert_eq!(resolve_alias("typing"), "typing_start");
    }

    #[test]
    fn test_canonical_names_pass_through() {
        assert_eq!(resolve_alias("message_create"), "message_create");
        assert_eq!(resolve_alias("some_future_event"), "some_future_event");
    }

    #[test]
    fn test_parse_event_lowercases_wire_names() {
        let (name, payload) = parse_event("MESSAGE_CREATE", serde_json::json!({"id": "1"}));
        assert_eq!(name, "message_create");
        assert_eq!(payload["id"], "1");
    }

    #[test]
    fn test_parse_event_forwards_unregistered() {
        let (name, payload) = parse_event("BRAND_NEW_EVENT", serde_json::json!({"k": 5}));
        assert_eq!(name, "brand_new_event");
        assert_eq!(payload["k"], 5);
    }

    #[test]
    fn test_registered_events() {
        assert!(is_registered("message_create"));
        assert!(is_registered("ready"));
        assert!(!is_registered("brand_new_event"));
    }
}
