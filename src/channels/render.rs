//! Post text rendering
//!
//! Posts use legacy Telegram Markdown:
//!
//! ```text
//! *01.05* Jazz night
//!
//! Body text...
//!
//! *Where:* Club, Main st. 1
//! *When:* 01.05 19:00–22:00
//! *Price:* [500 rub](https://example.com/e1)
//! ```

use chrono::{DateTime, FixedOffset, Utc};

use crate::models::Event;
use crate::utils::{collapse_blank_lines, escape_markdown, normalize_whitespace, truncate_text};

/// Maximum caption length accepted with a photo
pub const CAPTION_LIMIT: usize = 1024;

/// Maximum text length of a plain message
pub const MESSAGE_LIMIT: usize = 4096;

fn local(t: DateTime<Utc>, offset: FixedOffset) -> DateTime<FixedOffset> {
    t.with_timezone(&offset)
}

/// Human-readable event time span
pub fn format_when(from: DateTime<Utc>, to: DateTime<Utc>, offset: FixedOffset) -> String {
    let from = local(from, offset);
    let to = local(to, offset);

    if to <= from {
        from.format("%d.%m %H:%M").to_string()
    } else if from.date_naive() == to.date_naive() {
        format!("{}–{}", from.format("%d.%m %H:%M"), to.format("%H:%M"))
    } else {
        format!("{} – {}", from.format("%d.%m %H:%M"), to.format("%d.%m %H:%M"))
    }
}

/// Render the post text for `event`
///
/// With a `limit`, only the body is shortened so the header and the footer
/// (and their links) stay intact.
pub fn render_post(event: &Event, offset: FixedOffset, limit: Option<usize>) -> String {
    let header = format!(
        "*{}* {}\n\n",
        local(event.from_time, offset).format("%d.%m"),
        escape_markdown(&normalize_whitespace(&event.title))
    );

    let mut footer = String::from("\n\n");
    if let Some(address) = event.address.as_deref().filter(|a| !a.trim().is_empty()) {
        footer.push_str(&format!("*Where:* {}\n", escape_markdown(address.trim())));
    }
    footer.push_str(&format!(
        "*When:* {}\n",
        format_when(event.from_time, event.to_time, offset)
    ));
    match event.price.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(price) => footer.push_str(&format!(
            "*Price:* [{}]({})",
            escape_markdown(price.trim()),
            event.url
        )),
        None => footer.push_str(&format!("[Details]({})", event.url)),
    }

    let body = escape_markdown(&collapse_blank_lines(&event.body));
    let body = match limit {
        Some(limit) => {
            let fixed = header.chars().count() + footer.chars().count();
            truncate_text(&body, limit.saturating_sub(fixed))
        }
        None => body,
    };

    format!("{header}{body}{footer}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600).unwrap()
    }

    fn event() -> Event {
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 16, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 5, 1, 19, 0, 0).unwrap();
        Event::new("E1", "test", "Jazz_night", "https://example.com/e1", from, to)
            .with_body("An evening\n\n\n\nof jazz.")
            .with_address("Club, Main st. 1")
            .with_price("500 rub")
    }

    #[test]
    fn test_format_when() {
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 16, 0, 0).unwrap();
        let same_day = Utc.with_ymd_and_hms(2024, 5, 1, 19, 0, 0).unwrap();
        let next_day = Utc.with_ymd_and_hms(2024, 5, 2, 19, 0, 0).unwrap();

        assert_eq!(format_when(from, from, offset()), "01.05 19:00");
        assert_eq!(format_when(from, same_day, offset()), "01.05 19:00–22:00");
        assert_eq!(format_when(from, next_day, offset()), "01.05 19:00 – 02.05 22:00");
    }

    #[test]
    fn test_render_post() {
        let text = render_post(&event(), offset(), None);

        assert!(text.starts_with("*01.05* Jazz\\_night\n\n"));
        assert!(text.contains("An evening\n\nof jazz."));
        assert!(text.contains("*Where:* Club, Main st. 1"));
        assert!(text.contains("*When:* 01.05 19:00–22:00"));
        assert!(text.ends_with("*Price:* [500 rub](https://example.com/e1)"));
    }

    #[test]
    fn test_render_without_price_links_details() {
        let mut event = event();
        event.price = None;
        event.address = None;

        let text = render_post(&event, offset(), None);
        assert!(!text.contains("Where"));
        assert!(text.ends_with("[Details](https://example.com/e1)"));
    }

    #[test]
    fn test_limit_shortens_body_only() {
        let event = event().with_body("word ".repeat(500));
        let text = render_post(&event, offset(), Some(CAPTION_LIMIT));

        assert!(text.chars().count() <= CAPTION_LIMIT);
        assert!(text.ends_with("*Price:* [500 rub](https://example.com/e1)"));
        assert!(text.contains('…'));
    }
}
