//! Turns chat-platform messages into window messages.

use murmur_core::channel::InboundMessage;
use murmur_core::message::{Component, Message, Role};

/// Longest quoted-message preview, in characters.
pub const REFERENCE_PREVIEW_CHARS: usize = 300;

const IMAGE_EXTENSIONS: [&str; 6] = [".png", ".jpg", ".jpeg", ".webp", ".bmp", ".gif"];

/// Format an inbound message as a user-role [`Message`].
///
/// The text reads `[<ref>] <name> (<id>): <content>` so the model can tell
/// speakers apart and quote message ids. Image links and attachments become
/// image components; a quoted message becomes a `REFERENCE` component.
pub fn to_message(inbound: &InboundMessage) -> Message {
    let author = &inbound.author;
    let header = match &inbound.message_ref {
        Some(r) => format!("[{r}] {} ({})", author.name, author.id),
        None => format!("{} ({})", author.name, author.id),
    };

    let mut components = vec![Component::text(format!("{header}: {}", inbound.content))];

    if let Some(quoted) = &inbound.quoted {
        let preview = preview(&quoted.content);
        components.push(if quoted.from_assistant {
            Component::reference_to_self(preview)
        } else {
            Component::reference_to(quoted.author_name.as_deref().unwrap_or("user"), preview)
        });
    }

    let mut urls: Vec<String> = Vec::new();
    for url in inbound
        .image_urls
        .iter()
        .map(String::as_str)
        .chain(image_links(&inbound.content))
    {
        let url = static_frame(url);
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    components.extend(urls.into_iter().map(Component::image));

    Message::new(Role::User, components).with_author(author.clone())
}

/// Links in `text` that point at an image file.
pub fn image_links(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
        .map(|word| word.trim_matches(|c: char| matches!(c, '<' | '>' | '(' | ')' | '"' | '\'')))
        .filter(|word| word.starts_with("http://") || word.starts_with("https://"))
        .filter(|word| is_image_url(word))
}

fn is_image_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Animated GIFs are requested as a still frame.
fn static_frame(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if !path.ends_with(".gif") {
        return url.to_string();
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}format=png")
}

/// Single-line preview of a quoted message.
pub fn preview(content: &str) -> String {
    let flat = content.replace(['\r', '\n'], " ");
    if flat.trim().is_empty() {
        return "(message without text)".into();
    }
    if flat.chars().count() > REFERENCE_PREVIEW_CHARS {
        let cut: String = flat.chars().take(REFERENCE_PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        flat
    }
}
