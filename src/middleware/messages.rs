//! Localized throttling messages.

/// Languages the throttling message is available in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locale {
    #[default]
    En,
    Es,
    Fr,
    De,
    Ja,
}

impl Locale {
    /// Match a language tag on its primary subtag, e.g. `fr-CA` → `Fr`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let primary = tag.trim().split(|c: char| c == '-' || c == '_').next()?.to_ascii_lowercase();
        match primary.as_str() {
            "en" => Some(Locale::En),
            "es" => Some(Locale::Es),
            "fr" => Some(Locale::Fr),
            "de" => Some(Locale::De),
            "ja" => Some(Locale::Ja),
            _ => None,
        }
    }

    /// Pick the supported language with the highest quality from an
    /// `Accept-Language` value, falling back to English.
    pub fn from_accept_language(header: Option<&str>) -> Self {
        let Some(header) = header else {
            return Locale::default();
        };

        let mut best: Option<(Locale, f32)> = None;
        for item in header.split(',') {
            let mut parts = item.split(';');
            let Some(locale) = parts.next().and_then(Locale::from_tag) else {
                continue;
            };
            let quality = parts
                .find_map(|p| p.trim().strip_prefix("q="))
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);

            if quality > 0.0 && best.map_or(true, |(_, q)| quality > q) {
                best = Some((locale, quality));
            }
        }

        best.map(|(locale, _)| locale).unwrap_or_default()
    }
}

/// Message telling a throttled caller how long to wait.
pub fn rate_limit_message(locale: Locale, retry_after_secs: u64) -> String {
    let n = retry_after_secs;
    let one = n == 1;
    match locale {
        Locale::En => format!(
            "Too many requests. Please try again in {} {}.",
            n,
            if one { "second" } else { "seconds" }
        ),
        Locale::Es => format!(
            "Demasiadas solicitudes. Inténtalo de nuevo en {} {}.",
            n,
            if one { "segundo" } else { "segundos" }
        ),
        Locale::Fr => format!(
            "Trop de requêtes. Veuillez réessayer dans {} {}.",
            n,
            if one { "seconde" } else { "secondes" }
        ),
        Locale::De => format!(
            "Zu viele Anfragen. Bitte versuchen Sie es in {} {} erneut.",
            n,
            if one { "Sekunde" } else { "Sekunden" }
        ),
        Locale::Ja => format!("リクエストが多すぎます。{}秒後に再試行してください。", n),
    }
}
