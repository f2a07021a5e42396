//! Turning stored interactions into conversation history.

use hangouts_core::types::{Interaction, InteractionKind, Message};

/// Messages for `interactions` (oldest first), keeping the newest `limit`.
/// Alarm interactions only contribute the assistant's reminder text; failed
/// interactions contribute nothing.
pub fn to_messages(interactions: &[Interaction], limit: usize) -> Vec<Message> {
    let mut messages = Vec::new();
    for i in interactions {
        let Some(response) = i.response.as_deref() else {
            continue;
        };
        if i.kind == InteractionKind::Message {
            messages.push(Message::user(&i.prompt));
        }
        messages.push(Message::assistant(response));
    }
    let skip = messages.len().saturating_sub(limit);
    messages.split_off(skip)
}
