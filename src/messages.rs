//! Message-template strategy interface. Text generation itself is treated
//! as an opaque concern; this module only fixes the event-type tags and a
//! deterministic default implementation good enough to drive the Broadcast
//! Bus and exercise the rest of the pipeline in tests.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventTag {
    SatsReceived,
    FeederTriggered,
    CyberHerd,
    HeadbuttFailure,
    HeadbuttSuccess,
    InterfaceInfo,
    WeatherStatus,
    DailyReset,
    FeedingRegular,
    FeedingBonus,
    FeedingRemainder,
    FeedingFallback,
}

impl EventTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTag::SatsReceived => "sats_received",
            EventTag::FeederTriggered => "feeder_triggered",
            EventTag::CyberHerd => "cyber_herd",
            EventTag::HeadbuttFailure => "headbutt_failure",
            EventTag::HeadbuttSuccess => "headbutt_success",
            EventTag::InterfaceInfo => "interface_info",
            EventTag::WeatherStatus => "weather_status",
            EventTag::DailyReset => "daily_reset",
            EventTag::FeedingRegular => "feeding_regular",
            EventTag::FeedingBonus => "feeding_bonus",
            EventTag::FeedingRemainder => "feeding_remainder",
            EventTag::FeedingFallback => "feeding_fallback",
        }
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered key/value context passed to a template; callers build this with
/// whatever fields matter for the tag (e.g. `new_amount`, `difference`,
/// `pubkey`, `required`).
pub type TemplateContext = Vec<(&'static str, String)>;

/// A rendered message: display text plus an opaque id used for dedup and
/// for `HerdMember.notified`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub id: String,
}

pub trait MessageTemplates: Send + Sync {
    fn render(&self, tag: EventTag, ctx: &TemplateContext) -> Rendered;
}

/// Deterministic, dependency-free template set: `"<tag>: k1=v1 k2=v2"`,
/// with the id derived from the tag and the first context value (or just
/// the tag if context is empty) so repeated renders of the same logical
/// event dedupe.
pub struct PlainTemplates;

impl MessageTemplates for PlainTemplates {
    fn render(&self, tag: EventTag, ctx: &TemplateContext) -> Rendered {
        let body = ctx
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        let text = if body.is_empty() {
            tag.to_string()
        } else {
            format!("{tag}: {body}")
        };
        let id = match ctx.first() {
            Some((_, v)) => format!("{tag}:{v}"),
            None => tag.to_string(),
        };
        Rendered { text, id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_tag_and_context() {
        let tpl = PlainTemplates;
        let out = tpl.render(
            EventTag::SatsReceived,
            &vec![("new_amount", "50".to_string()), ("difference", "950".to_string())],
        );
        assert_eq!(out.text, "sats_received: new_amount=50 difference=950");
        assert_eq!(out.id, "sats_received:50");
    }

    #[test]
    fn empty_context_falls_back_to_bare_tag() {
        let tpl = PlainTemplates;
        let out = tpl.render(EventTag::DailyReset, &vec![]);
        assert_eq!(out.text, "daily_reset");
        assert_eq!(out.id, "daily_reset");
    }
}
