//! Per-cycle developer prompt.
//!
//! The developer prompt is never stored in a window: it is rebuilt at the
//! start of every cycle so the date it carries is always current, and it
//! carries the requester's profile as read at that moment.

use chrono::{DateTime, Local, TimeZone};
use murmur_core::memory::MemoryProfile;
use murmur_core::message::{Component, Message};

/// Renders the developer prompt template.
///
/// Placeholders: `{name}` (assistant name), `{weekday}` and `{datetime}`.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: String,
    assistant_name: String,
}

impl PromptBuilder {
    pub fn new(template: impl Into<String>, assistant_name: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            assistant_name: assistant_name.into(),
        }
    }

    pub fn assistant_name(&self) -> &str {
        &self.assistant_name
    }

    /// Build the prompt for a cycle starting now.
    pub fn build(&self, profile: Option<(&MemoryProfile, &str)>) -> Message {
        self.build_at(&Local::now(), profile)
    }

    /// Build the prompt as of `now`. `profile` pairs the requester's profile
    /// with their display name; empty profiles are left out.
    pub fn build_at<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
        profile: Option<(&MemoryProfile, &str)>,
    ) -> Message
    where
        Tz::Offset: std::fmt::Display,
    {
        let text = self
            .template
            .replace("{name}", &self.assistant_name)
            .replace("{weekday}", &now.format("%A").to_string())
            .replace("{datetime}", &now.format("%Y-%m-%d %H:%M %Z").to_string());

        let mut components = vec![Component::text(text)];
        if let Some((profile, display_name)) = profile.filter(|(p, _)| !p.is_empty()) {
            components.push(Component::text("\n"));
            components.push(profile.to_component(display_name));
        }
        Message::developer(components)
    }
}
