use chrono::{DateTime, Utc};
use poise::serenity_prelude::GuildId;

const DISCORD_MESSAGE_LIMIT: usize = 1900;

#[macro_export]
macro_rules! default_struct {
    (
        $(#[$struct_meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_vis:vis $field:ident : $type:ty $(= $default:expr)?
            ),* $(,)?
        }
    ) => {
        $(#[$struct_meta])*
        $vis struct $name {
            $(
                $(#[$field_meta])*
                $field_vis $field: $type
            ),*
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    $(
                        $field: $crate::default_struct!(@default $($default)?)
                    ),*
                }
            }
        }
    };
    (@default) => {
        Default::default()
    };
    (@default $expr:expr) => {
        $expr
    };
}

pub fn guild_label(guild_id: Option<GuildId>) -> String {
    guild_id.map_or_else(|| "DM".to_string(), |id| id.to_string())
}

/// Relative Discord timestamp, e.g. "5 minutes ago".
pub fn relative_time(at: DateTime<Utc>) -> String {
    format!("<t:{}:R>", at.timestamp())
}

/// Trims console output so it fits in one message, keeping the newest lines.
pub fn tail_for_discord(output: &str) -> String {
    let chars = output.chars().count();
    if chars <= DISCORD_MESSAGE_LIMIT {
        return output.to_string();
    }
    let tail: String = output.chars().skip(chars - DISCORD_MESSAGE_LIMIT).collect();
    format!("…{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_is_untouched() {
        assert_eq!(tail_for_discord("[Server] hi"), "[Server] hi");
    }

    #[test]
    fn long_output_keeps_the_end() {
        let output = format!("{}END", "é".repeat(3000));
        let trimmed = tail_for_discord(&output);
        assert!(trimmed.starts_with('…'));
        assert!(trimmed.ends_with("END"));
        assert_eq!(trimmed.chars().count(), DISCORD_MESSAGE_LIMIT + 1);
    }

    #[test]
    fn dm_label_without_guild() {
        assert_eq!(guild_label(None), "DM");
        assert_eq!(guild_label(Some(GuildId::new(42))), "42");
    }
}
