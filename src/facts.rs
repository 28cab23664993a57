use minijinja::{context, Environment};
use serde_json::{Map, Value};

const LOCATION_TEMPLATE: &str = "User is based in {{ value }}";
const ROLE_PREFERENCE_TEMPLATE: &str = "User is interested in {{ value }} roles";
const SKILL_TEMPLATE: &str = "User has experience with {{ value }}";
const COMPANY_TEMPLATE: &str = "User worked at {{ value }} as {{ job_title }}";
const INTEREST_TEMPLATE: &str = "User has an interest in {{ value }}";
const GENERIC_TEMPLATE: &str = "User preference: {{ item_type }} = {{ value }}";

const DEFAULT_JOB_TITLE: &str = "a role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Location,
    RolePreference,
    Skill,
    Company,
    Interest,
}

impl ItemType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "location" => Some(Self::Location),
            "role_preference" => Some(Self::RolePreference),
            "skill" => Some(Self::Skill),
            "company" => Some(Self::Company),
            "interest" => Some(Self::Interest),
            _ => None,
        }
    }

    fn template(self) -> &'static str {
        match self {
            Self::Location => LOCATION_TEMPLATE,
            Self::RolePreference => ROLE_PREFERENCE_TEMPLATE,
            Self::Skill => SKILL_TEMPLATE,
            Self::Company => COMPANY_TEMPLATE,
            Self::Interest => INTEREST_TEMPLATE,
        }
    }
}

/// Turns a profile item into the sentence handed to the memory service's
/// fact extraction.
pub fn synthesize(item_type: &str, value: &str, metadata: &Map<String, Value>) -> String {
    let job_title = metadata
        .get("job_title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .unwrap_or(DEFAULT_JOB_TITLE);
    let template = ItemType::parse(item_type)
        .map(ItemType::template)
        .unwrap_or(GENERIC_TEMPLATE);

    let mut env = Environment::new();
    if env.add_template("fact", template).is_err() {
        return fallback_fact(item_type, value, job_title);
    }
    let Ok(template) = env.get_template("fact") else {
        return fallback_fact(item_type, value, job_title);
    };

    template
        .render(context! {
            item_type => item_type,
            value => value,
            job_title => job_title,
        })
        .unwrap_or_else(|_| fallback_fact(item_type, value, job_title))
}

fn fallback_fact(item_type: &str, value: &str, job_title: &str) -> String {
    match ItemType::parse(item_type) {
        Some(ItemType::Location) => format!("User is based in {value}"),
        Some(ItemType::RolePreference) => format!("User is interested in {value} roles"),
        Some(ItemType::Skill) => format!("User has experience with {value}"),
        Some(ItemType::Company) => format!("User worked at {value} as {job_title}"),
        Some(ItemType::Interest) => format!("User has an interest in {value}"),
        None => format!("User preference: {item_type} = {value}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn location_sentence() {
        assert_eq!(
            synthesize("location", "Manchester", &Map::new()),
            "User is based in Manchester"
        );
    }

    #[test]
    fn company_uses_job_title_or_default() {
        assert_eq!(
            synthesize("company", "Acme", &meta(json!({ "job_title": "CFO" }))),
            "User worked at Acme as CFO"
        );
        assert_eq!(
            synthesize("company", "Acme", &meta(json!({ "job_title": "  " }))),
            "User worked at Acme as a role"
        );
        assert_eq!(
            synthesize("company", "Acme", &Map::new()),
            "User worked at Acme as a role"
        );
    }

    #[test]
    fn known_types() {
        assert_eq!(
            synthesize("role_preference", "CTO", &Map::new()),
            "User is interested in CTO roles"
        );
        assert_eq!(
            synthesize("skill", "M&A", &Map::new()),
            "User has experience with M&A"
        );
        assert_eq!(
            synthesize("interest", "climate tech", &Map::new()),
            "User has an interest in climate tech"
        );
    }

    #[test]
    fn unknown_type_falls_back_verbatim() {
        let sentence = synthesize("day_rate", "<900>", &Map::new());
        assert_eq!(sentence, "User preference: day_rate = <900>");
    }

    #[test]
    fn fallback_matches_templates() {
        for (item_type, value) in [
            ("location", "Leeds"),
            ("role_preference", "CFO"),
            ("skill", "SQL"),
            ("company", "Initech"),
            ("interest", "fintech"),
            ("other", "x"),
        ] {
            assert_eq!(
                synthesize(item_type, value, &Map::new()),
                fallback_fact(item_type, value, DEFAULT_JOB_TITLE)
            );
        }
    }
}
