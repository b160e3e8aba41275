//! `${VAR}` expansion for config file contents.
//!
//! Two forms are understood:
//! - `${VAR}` becomes the variable's value. When the variable is unset the
//!   placeholder is left in place, so a missing secret shows up verbatim in
//!   the parsed config instead of silently becoming an empty string.
//! - `${VAR:-fallback}` becomes the fallback when the variable is unset or
//!   empty, matching the shell meaning. This is how `livedesk.toml` ships
//!   usable defaults for `database.url` and `auth.jwt_secret` while still
//!   letting deployments override them from the environment.

pub fn substitute_env(input: &str) -> String {
    expand(input, |name| std::env::var(name).ok())
}

fn expand(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated placeholder; keep the tail verbatim.
            out.push_str(&rest[start..]);
            return out;
        };
        let body = &after[..end];
        rest = &after[end + 1..];

        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        if name.is_empty() {
            keep_literal(&mut out, body);
            continue;
        }

        match (lookup(name), fallback) {
            // The shell rule: a fallback also covers set-but-empty.
            (Some(value), Some(fallback)) if value.is_empty() => out.push_str(fallback),
            (Some(value), _) => out.push_str(&value),
            (None, Some(fallback)) => out.push_str(fallback),
            (None, None) => keep_literal(&mut out, body),
        }
    }

    out.push_str(rest);
    out
}

fn keep_literal(out: &mut String, body: &str) {
    out.push_str("${");
    out.push_str(body);
    out.push('}');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "DB_URL" => Some("sqlite:live.db".into()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn replaces_set_variables() {
        assert_eq!(expand("url = \"${DB_URL}\"", lookup), "url = \"sqlite:live.db\"");
    }

    #[test]
    fn keeps_unset_variables_visible() {
        assert_eq!(expand("${JWT_SECRET}", lookup), "${JWT_SECRET}");
    }

    #[test]
    fn fallback_applies_when_unset_or_empty() {
        assert_eq!(expand("${JWT_SECRET:-dev-secret}", lookup), "dev-secret");
        assert_eq!(expand("${EMPTY:-fallback}", lookup), "fallback");
    }

    #[test]
    fn fallback_is_ignored_when_set() {
        assert_eq!(expand("${DB_URL:-other.db}", lookup), "sqlite:live.db");
    }

    #[test]
    fn expands_several_placeholders_per_line() {
        assert_eq!(
            expand("${DB_URL} and ${MISSING} and ${EMPTY:-x}", lookup),
            "sqlite:live.db and ${MISSING} and x"
        );
    }

    #[test]
    fn unterminated_and_nameless_placeholders_stay_literal() {
        assert_eq!(expand("tail ${DB_URL", lookup), "tail ${DB_URL");
        assert_eq!(expand("${}", lookup), "${}");
        assert_eq!(expand("${:-x}", lookup), "${:-x}");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(expand("no placeholders here", lookup), "no placeholders here");
    }
}
