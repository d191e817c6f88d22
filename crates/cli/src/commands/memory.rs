//! `murmur memory`: Profile management commands.

use murmur_core::memory::MemoryProfile;
use murmur_core::message::UserId;

use super::{Stores, load_config};

pub async fn show(user: &str) -> anyhow::Result<()> {
    let config = load_config()?;
    let stores = Stores::open(&config).await?;
    let profile = stores.memory.get_profile(&UserId::from(user)).await?;
    print!("{}", render(&profile));
    Ok(())
}

pub async fn reset(user: &str) -> anyhow::Result<()> {
    let config = load_config()?;
    let stores = Stores::open(&config).await?;
    if stores.memory.reset(&UserId::from(user)).await? {
        println!("🗑️  Profile of {user} deleted.");
    } else {
        println!("No profile stored for {user}.");
    }
    Ok(())
}

pub async fn list() -> anyhow::Result<()> {
    let config = load_config()?;
    let stores = Stores::open(&config).await?;

    let profiles = stores.memory.list_profiles().await?;
    println!("🧠 Profiles ({})", profiles.len());
    println!("============");
    for p in &profiles {
        println!(
            "  {:<20} {:>3} facts  updated {}",
            p.user_id,
            p.facts.len(),
            p.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub fn render(profile: &MemoryProfile) -> String {
    if profile.is_empty() {
        return format!("Nothing is known about {} yet.\n", profile.user_id);
    }
    let mut out = format!("🧠 Profile of {}\n", profile.user_id);
    for (key, value) in &profile.facts {
        out.push_str(&format!("  {key:<16} {value}\n"));
    }
    out.push_str(&format!(
        "  (updated {}, {} messages since)\n",
        profile.updated_at.format("%Y-%m-%d %H:%M"),
        profile.messages_since_update
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_profile_renders_a_notice() {
        let text = render(&MemoryProfile::empty(UserId::from("42")));
        assert!(text.contains("Nothing is known about 42"));
    }

    #[test]
    fn facts_are_listed() {
        let mut profile = MemoryProfile::empty(UserId::from("42"));
        profile.facts.insert("city".into(), "Lyon".into());
        let text = render(&profile);
        assert!(text.contains("city"));
        assert!(text.contains("Lyon"));
    }
}
