use crate::config::{EngineConfig, RuntimeProfile};

const MAIL_HINTS: [&str; 4] = ["email", "e-mail", "mail", "resend"];
const SCRAPING_HINTS: [&str; 5] = ["selenium", "playwright", "beautifulsoup", "scrape", "crawler"];
const ML_HINTS: [&str; 6] = [
    "pytorch",
    "tensorflow",
    "scikit",
    "sklearn",
    "xgboost",
    "train model",
];
const QA_HINTS: [&str; 4] = ["pytest", "unit test", "integration test", "coverage"];
const DATA_HINTS: [&str; 5] = ["csv", "pandas", "numpy", "dataset", "dataframe"];

/// Resolve the runtime profile for a run. `auto` inspects the task text and
/// selected capability names; the match order is the tie-break precedence
/// (data-flavored signals win over plain web signals).
pub fn resolve_profile(
    requested: RuntimeProfile,
    task: &str,
    skill_names: &[String],
) -> RuntimeProfile {
    if requested != RuntimeProfile::Auto {
        return requested;
    }

    let text = task.to_ascii_lowercase();
    let names: Vec<String> = skill_names
        .iter()
        .map(|name| name.to_ascii_lowercase())
        .collect();
    let text_has = |hints: &[&str]| hints.iter().any(|hint| text.contains(hint));
    let name_has = |needles: &[&str]| {
        names
            .iter()
            .any(|name| needles.iter().any(|needle| name.contains(needle)))
    };

    if text_has(&MAIL_HINTS) || name_has(&["sendmail", "mail"]) {
        // Mail-sending scripts need third-party packages missing from the
        // slim base image.
        RuntimeProfile::Data
    } else if text_has(&SCRAPING_HINTS) || name_has(&["scrap", "crawl"]) {
        RuntimeProfile::Scraping
    } else if text_has(&ML_HINTS) || name_has(&["ml", "model"]) {
        RuntimeProfile::Ml
    } else if text_has(&QA_HINTS) || name_has(&["test", "qa"]) {
        RuntimeProfile::Qa
    } else if text_has(&DATA_HINTS) || name_has(&["data"]) {
        RuntimeProfile::Data
    } else if text.contains("http://")
        || text.contains("https://")
        || text.contains("url")
        || name_has(&["web"])
    {
        RuntimeProfile::Web
    } else {
        RuntimeProfile::Base
    }
}

pub fn resolve_runtime_image(
    config: &EngineConfig,
    task: &str,
    skill_names: &[String],
) -> (String, RuntimeProfile) {
    let profile = resolve_profile(config.image_profile, task, skill_names);
    (config.images.for_profile(profile).to_string(), profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auto(task: &str, skills: &[&str]) -> RuntimeProfile {
        let names: Vec<String> = skills.iter().map(|s| s.to_string()).collect();
        resolve_profile(RuntimeProfile::Auto, task, &names)
    }

    #[test]
    fn explicit_profile_wins() {
        assert_eq!(
            resolve_profile(RuntimeProfile::Qa, "analyze csv data", &[]),
            RuntimeProfile::Qa
        );
    }

    #[test]
    fn data_beats_web_on_mixed_signals() {
        assert_eq!(
            auto("download the csv from https://example.com and chart it", &[]),
            RuntimeProfile::Data
        );
    }

    #[test]
    fn auto_precedence_covers_each_family() {
        assert_eq!(auto("send an email with the report", &[]), RuntimeProfile::Data);
        assert_eq!(auto("scrape the product page", &[]), RuntimeProfile::Scraping);
        assert_eq!(auto("train model on the dataset", &[]), RuntimeProfile::Ml);
        assert_eq!(auto("run pytest over the module", &[]), RuntimeProfile::Qa);
        assert_eq!(auto("summarize https://example.com", &[]), RuntimeProfile::Web);
        assert_eq!(auto("print the current date", &[]), RuntimeProfile::Base);
    }

    #[test]
    fn skill_names_contribute_hints() {
        assert_eq!(auto("do the thing", &["web-intel"]), RuntimeProfile::Web);
        assert_eq!(auto("do the thing", &["sendmail"]), RuntimeProfile::Data);
    }
}
