//! Prompt assembly: system prompt, owner preferences, history, then the intent.

use hangouts_core::types::{Intent, Message, UserContext};

/// Chat messages for one engine request.
pub fn build_messages(system_prompt: &str, context: &UserContext, intent: &Intent) -> Vec<Message> {
    let mut system = system_prompt.trim().to_string();
    if !context.preferences.is_empty() {
        let mut prefs: Vec<_> = context.preferences.iter().collect();
        prefs.sort();
        system.push_str("\n\nWhat you know about the user:");
        for (key, value) in prefs {
            system.push_str(&format!("\n- {key}: {value}"));
        }
    }

    let mut messages = Vec::with_capacity(context.history.len() + 2);
    messages.push(Message::system(&system));
    messages.extend(context.history.iter().cloned());
    messages.push(Message::user(&intent_text(intent)));
    messages
}

fn intent_text(intent: &Intent) -> String {
    match intent {
        Intent::Alarm { payload, fire_at } => format!(
            "A reminder the user set is due now ({} UTC). Their note: \"{payload}\". \
             Write the short, friendly message that reminds them.",
            fire_at.format("%Y-%m-%d %H:%M")
        ),
        Intent::Message { text } => text.clone(),
    }
}
