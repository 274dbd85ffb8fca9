use serde::{Deserialize, Serialize};
use whatlang::Lang;

/// Full-text configuration used by the keyword branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextSearchLanguage {
    English,
    Italian,
}

struct TextSearchConfig {
    language: TextSearchLanguage,
    code: &'static str,
    regconfig: &'static str,
}

const TEXT_SEARCH_CONFIGS: [TextSearchConfig; 2] = [
    TextSearchConfig {
        language: TextSearchLanguage::English,
        code: "en",
        regconfig: "english",
    },
    TextSearchConfig {
        language: TextSearchLanguage::Italian,
        code: "it",
        regconfig: "italian",
    },
];

impl TextSearchLanguage {
    fn config(self) -> &'static TextSearchConfig {
        match self {
            TextSearchLanguage::English => &TEXT_SEARCH_CONFIGS[0],
            TextSearchLanguage::Italian => &TEXT_SEARCH_CONFIGS[1],
        }
    }

    /// Postgres text search configuration name, bound as a query parameter.
    pub fn regconfig(self) -> &'static str {
        self.config().regconfig
    }

    pub fn code(self) -> &'static str {
        self.config().code
    }

    pub fn all() -> impl Iterator<Item = TextSearchLanguage> {
        TEXT_SEARCH_CONFIGS.iter().map(|config| config.language)
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        TEXT_SEARCH_CONFIGS
            .iter()
            .find(|config| config.code.eq_ignore_ascii_case(code))
            .map(|config| config.language)
    }
}

/// Detects the query language; anything outside the supported set falls back to English.
pub fn detect_language(text: &str) -> TextSearchLanguage {
    match whatlang::detect_lang(text) {
        Some(Lang::Ita) => TextSearchLanguage::Italian,
        _ => TextSearchLanguage::English,
    }
}

/// A recognised hint wins over detection.
pub fn resolve_language(text: &str, hint: Option<&str>) -> TextSearchLanguage {
    hint.and_then(TextSearchLanguage::from_code)
        .unwrap_or_else(|| detect_language(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_table_maps_every_language() {
        assert_eq!(TextSearchLanguage::English.regconfig(), "english");
        assert_eq!(TextSearchLanguage::Italian.regconfig(), "italian");
        assert_eq!(
            TextSearchLanguage::from_code("IT"),
            Some(TextSearchLanguage::Italian)
        );
        assert_eq!(TextSearchLanguage::from_code("de"), None);
    }

    #[test]
    fn italian_sentences_select_italian_configuration() {
        let language = detect_language(
            "la varianza misura quanto i dati sono dispersi rispetto alla media della popolazione",
        );
        assert_eq!(language, TextSearchLanguage::Italian);
    }

    #[test]
    fn unsupported_or_empty_text_defaults_to_english() {
        assert_eq!(detect_language(""), TextSearchLanguage::English);
        assert_eq!(
            detect_language("die Varianz beschreibt die Streuung der Daten um den Mittelwert herum"),
            TextSearchLanguage::English
        );
    }

    #[test]
    fn hint_overrides_detection() {
        assert_eq!(
            resolve_language("variance explanation", Some("en")),
            TextSearchLanguage::English
        );
        assert_eq!(
            resolve_language("variance explanation", Some("it")),
            TextSearchLanguage::Italian
        );
        assert_eq!(
            resolve_language("", Some("fr")),
            TextSearchLanguage::English
        );
    }
}
