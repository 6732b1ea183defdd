//! Request templates with placeholders, compiled once at load time.
//!
//! Supported placeholders:
//! - `{uuid}`: random v4 UUID
//! - `{int:A-B}`: uniform integer in `[A, B]`
//! - `{choice:a|b|c}`: one of the listed values
//! - `{today}`: current date, ISO 8601
//! - `{days_ago:N}` or `{days_ago:a|b|c}`: the date N days back (N picked from the list)
//! - `{tenant}`: the user's tenant identifier
//! - `{var:name}`: a value captured earlier by the same virtual user
//!
//! `{{` and `}}` produce literal braces.

use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, NaiveDate};
use rand::Rng;
use serde_json::{Map, Value};

use crate::error::{LoadError, LoadResult};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Uuid,
    Int { min: i64, max: i64 },
    Choice(Vec<String>),
    Today,
    DaysAgo(Vec<u32>),
    Tenant,
    Var(String),
}

/// A user variable referenced by a template has not been captured yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingVariable(pub String);

/// Values a template draws from while rendering.
pub struct RenderContext<'a, R: Rng + ?Sized> {
    pub rng: &'a mut R,
    pub vars: &'a HashMap<String, String>,
    pub tenant: &'a str,
    pub today: NaiveDate,
}

/// A compiled string template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> LoadResult<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let rest = &source[i + 1..];
                    let end = rest
                        .find('}')
                        .ok_or_else(|| LoadError::invalid_template(source, "unclosed '{'"))?;
                    let body = &rest[..end];
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_placeholder(source, body)?);
                    // Skip the placeholder body and its closing brace.
                    for _ in 0..=body.chars().count() {
                        chars.next();
                    }
                }
                '}' => {
                    return Err(LoadError::invalid_template(source, "unmatched '}'"));
                }
                _ => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// The text the template was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when rendering never changes the output.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Names of the user variables this template reads.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Var(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn render<R: Rng + ?Sized>(
        &self,
        ctx: &mut RenderContext<'_, R>,
    ) -> Result<String, MissingVariable> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Uuid => out.push_str(&random_uuid(ctx.rng).to_string()),
                Segment::Int { min, max } => {
                    out.push_str(&ctx.rng.gen_range(*min..=*max).to_string())
                }
                Segment::Choice(options) => {
                    out.push_str(&options[ctx.rng.gen_range(0..options.len())])
                }
                Segment::Today => out.push_str(&ctx.today.format("%Y-%m-%d").to_string()),
                Segment::DaysAgo(options) => {
                    let days = options[ctx.rng.gen_range(0..options.len())];
                    let date = ctx.today - ChronoDuration::days(i64::from(days));
                    out.push_str(&date.format("%Y-%m-%d").to_string());
                }
                Segment::Tenant => out.push_str(ctx.tenant),
                Segment::Var(name) => match ctx.vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(MissingVariable(name.clone())),
                },
            }
        }
        Ok(out)
    }
}

/// UUIDs are drawn from the user's RNG so seeded runs stay reproducible.
fn random_uuid<R: Rng + ?Sized>(rng: &mut R) -> uuid::Uuid {
    let bytes: [u8; 16] = rng.gen();
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

fn parse_placeholder(source: &str, body: &str) -> LoadResult<Segment> {
    let (name, arg) = match body.split_once(':') {
        Some((name, arg)) => (name.trim(), Some(arg.trim())),
        None => (body.trim(), None),
    };

    let segment = match (name, arg) {
        ("uuid", None) => Segment::Uuid,
        ("today", None) => Segment::Today,
        ("tenant", None) => Segment::Tenant,
        ("int", Some(range)) => {
            let (min, max) = range
                .split_once('-')
                .ok_or_else(|| LoadError::invalid_template(source, "int expects {int:A-B}"))?;
            let min: i64 = min
                .trim()
                .parse()
                .map_err(|_| LoadError::invalid_template(source, "int bounds must be integers"))?;
            let max: i64 = max
                .trim()
                .parse()
                .map_err(|_| LoadError::invalid_template(source, "int bounds must be integers"))?;
            if min > max {
                return Err(LoadError::invalid_template(source, "int range is empty"));
            }
            Segment::Int { min, max }
        }
        ("choice", Some(list)) => {
            let options: Vec<String> = list
                .split('|')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if options.is_empty() {
                return Err(LoadError::invalid_template(source, "choice needs at least one value"));
            }
            Segment::Choice(options)
        }
        ("days_ago", Some(list)) => {
            let options = list
                .split('|')
                .map(|s| s.trim().parse::<u32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| {
                    LoadError::invalid_template(source, "days_ago expects non-negative integers")
                })?;
            Segment::DaysAgo(options)
        }
        ("var", Some(var)) if !var.is_empty() => Segment::Var(var.to_string()),
        _ => {
            return Err(LoadError::invalid_template(
                source,
                format!("unknown placeholder '{{{}}}'", body),
            ))
        }
    };

    Ok(segment)
}

/// A JSON body whose string leaves are templates.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonTemplate {
    Literal(Value),
    String(Template),
    Array(Vec<JsonTemplate>),
    Object(Vec<(String, JsonTemplate)>),
}

impl JsonTemplate {
    pub fn compile(value: &Value) -> LoadResult<Self> {
        Ok(match value {
            Value::String(s) => {
                let template = Template::parse(s)?;
                if template.is_static() {
                    JsonTemplate::Literal(Value::String(template.source().to_string()))
                } else {
                    JsonTemplate::String(template)
                }
            }
            Value::Array(items) => JsonTemplate::Array(
                items
                    .iter()
                    .map(JsonTemplate::compile)
                    .collect::<LoadResult<_>>()?,
            ),
            Value::Object(map) => JsonTemplate::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), JsonTemplate::compile(v)?)))
                    .collect::<LoadResult<_>>()?,
            ),
            other => JsonTemplate::Literal(other.clone()),
        })
    }

    pub fn variables(&self) -> Vec<&str> {
        match self {
            JsonTemplate::Literal(_) => Vec::new(),
            JsonTemplate::String(t) => t.variables().collect(),
            JsonTemplate::Array(items) => items.iter().flat_map(|i| i.variables()).collect(),
            JsonTemplate::Object(fields) => fields.iter().flat_map(|(_, v)| v.variables()).collect(),
        }
    }

    pub fn render<R: Rng + ?Sized>(
        &self,
        ctx: &mut RenderContext<'_, R>,
    ) -> Result<Value, MissingVariable> {
        Ok(match self {
            JsonTemplate::Literal(v) => v.clone(),
            JsonTemplate::String(t) => Value::String(t.render(ctx)?),
            JsonTemplate::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|i| i.render(ctx))
                    .collect::<Result<_, _>>()?,
            ),
            JsonTemplate::Object(fields) => {
                let mut map = Map::with_capacity(fields.len());
                for (key, value) in fields {
                    map.insert(key.clone(), value.render(ctx)?);
                }
                Value::Object(map)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn render(template: &str, vars: &HashMap<String, String>) -> Result<String, MissingVariable> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctx = RenderContext {
            rng: &mut rng,
            vars,
            tenant: "agency-1",
            today: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        };
        Template::parse(template).unwrap().render(&mut ctx)
    }

    #[test]
    fn test_static_template() {
        let t = Template::parse("/api/dashboard/summary").unwrap();
        assert!(t.is_static());
        assert_eq!(render("/api/dashboard/summary", &HashMap::new()).unwrap(), "/api/dashboard/summary");
    }

    #[test]
    fn test_dates_and_tenant() {
        let vars = HashMap::new();
        assert_eq!(render("{today}", &vars).unwrap(), "2024-03-31");
        assert_eq!(render("{days_ago:30}", &vars).unwrap(), "2024-03-01");
        assert_eq!(render("/t/{tenant}", &vars).unwrap(), "/t/agency-1");
    }

    #[test]
    fn test_random_placeholders_stay_in_range() {
        let vars = HashMap::new();
        for _ in 0..50 {
            let page: i64 = render("{int:1-5}", &vars).unwrap().parse().unwrap();
            assert!((1..=5).contains(&page));
        }
        let who = render("{choice:john|jane}", &vars).unwrap();
        assert!(who == "john" || who == "jane");
        let id = render("{uuid}", &vars).unwrap();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_variables() {
        let mut vars = HashMap::new();
        let t = "/api/ai/conversations/{var:conversation_id}/messages/";
        assert_eq!(render(t, &vars), Err(MissingVariable("conversation_id".to_string())));

        vars.insert("conversation_id".to_string(), "abc".to_string());
        assert_eq!(render(t, &vars).unwrap(), "/api/ai/conversations/abc/messages/");
    }

    #[test]
    fn test_escaped_braces() {
        assert_eq!(render("{{literal}}", &HashMap::new()).unwrap(), "{literal}");
    }

    #[test]
    fn test_invalid_templates() {
        assert!(Template::parse("{nope}").is_err());
        assert!(Template::parse("{int:5-1}").is_err());
        assert!(Template::parse("{int:a-b}").is_err());
        assert!(Template::parse("/open/{uuid").is_err());
        assert!(Template::parse("/close}").is_err());
        assert!(Template::parse("{var:}").is_err());
    }

    #[test]
    fn test_json_template() {
        let body = serde_json::json!({
            "agent_id": "{uuid}",
            "notes": "Updated via load test",
            "limit": 50,
            "nested": ["{tenant}"]
        });
        let compiled = JsonTemplate::compile(&body).unwrap();
        assert!(compiled.variables().is_empty());

        let vars = HashMap::new();
        let mut rng = StdRng::seed_from_u64(3);
        let mut ctx = RenderContext {
            rng: &mut rng,
            vars: &vars,
            tenant: "agency-1",
            today: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        };
        let rendered = compiled.render(&mut ctx).unwrap();
        assert_eq!(rendered["notes"], "Updated via load test");
        assert_eq!(rendered["limit"], 50);
        assert_eq!(rendered["nested"][0], "agency-1");
        assert!(uuid::Uuid::parse_str(rendered["agent_id"].as_str().unwrap()).is_ok());
    }
}
