use crate::config::QueryConfig;
use crate::error::{AppError, AppResult};
use crate::ingest::client::parse_ip;
use crate::types::{EventQueryParams, VisitorQueryParams};

/// Filterable columns. Only these names ever reach a backend query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    EventType,
    UserId,
    Page,
    Ip,
    CreatedAt,
    Payload,
    UserAgent,
    Referrer,
}

impl Field {
    pub fn column(&self) -> &'static str {
        match self {
            Field::EventType => "event_type",
            Field::UserId => "user_id",
            Field::Page => "page",
            Field::Ip => "ip",
            Field::CreatedAt => "created_at",
            Field::Payload => "payload",
            Field::UserAgent => "user_agent",
            Field::Referrer => "ref",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Equals {
        field: Field,
        value: String,
    },
    /// Inclusive range; a missing bound is open.
    Range {
        field: Field,
        from: Option<i64>,
        to: Option<i64>,
    },
    /// Case-insensitive substring match on any of `fields`.
    Contains {
        fields: Vec<Field>,
        needle: String,
    },
}

/// Backend-neutral predicate: every condition must hold. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSpec {
    conditions: Vec<Condition>,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, field: Field, value: impl Into<String>) -> Self {
        self.conditions.push(Condition::Equals {
            field,
            value: value.into(),
        });
        self
    }

    pub fn range(mut self, field: Field, from: Option<i64>, to: Option<i64>) -> Self {
        if from.is_some() || to.is_some() {
            self.conditions.push(Condition::Range { field, from, to });
        }
        self
    }

    pub fn contains(mut self, fields: &[Field], needle: impl Into<String>) -> Self {
        self.conditions.push(Condition::Contains {
            fields: fields.to_vec(),
            needle: needle.into(),
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

pub const EVENT_SEARCH_FIELDS: &[Field] = &[Field::Payload, Field::UserAgent];
pub const VISITOR_SEARCH_FIELDS: &[Field] = &[Field::Payload, Field::UserAgent, Field::Referrer];

/// Blank parameters count as absent.
fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn build_event_filter(params: &EventQueryParams) -> FilterSpec {
    let mut spec = FilterSpec::new();
    if let Some(event_type) = present(&params.event_type) {
        spec = spec.equals(Field::EventType, event_type);
    }
    if let Some(user_id) = present(&params.user_id) {
        spec = spec.equals(Field::UserId, user_id);
    }
    spec = spec.range(Field::CreatedAt, params.from_ts, params.to_ts);
    if let Some(q) = present(&params.q) {
        spec = spec.contains(EVENT_SEARCH_FIELDS, q);
    }
    spec
}

pub fn build_visitor_filter(params: &VisitorQueryParams) -> FilterSpec {
    let mut spec = FilterSpec::new();
    if let Some(page) = present(&params.page) {
        spec = spec.equals(Field::Page, page);
    }
    if let Some(ip) = present(&params.ip) {
        // Stored IPs are canonical; anything unparseable still matches verbatim.
        let ip = parse_ip(ip).unwrap_or_else(|| ip.to_string());
        spec = spec.equals(Field::Ip, ip);
    }
    spec = spec.range(Field::CreatedAt, params.from_ts, params.to_ts);
    if let Some(q) = present(&params.q) {
        spec = spec.contains(VISITOR_SEARCH_FIELDS, q);
    }
    spec
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Bounded(u32),
    /// Return every matching record.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: i64,
    pub limit: Limit,
}

impl Pagination {
    pub fn parse(
        offset: Option<i64>,
        limit: Option<&str>,
        config: &QueryConfig,
    ) -> AppResult<Self> {
        let offset = offset.unwrap_or(0);
        if offset < 0 {
            return Err(AppError::Validation(
                "offset must be greater than or equal to 0".to_string(),
            ));
        }

        let limit = match limit.map(str::trim).filter(|l| !l.is_empty()) {
            None => Limit::Bounded(config.default_limit),
            Some(l) if l.eq_ignore_ascii_case("all") => Limit::All,
            Some(l) => {
                let n: i64 = l.parse().map_err(|_| {
                    AppError::Validation(format!(
                        "limit must be an integer or 'all', got {l:?}"
                    ))
                })?;
                Limit::Bounded(n.clamp(1, config.max_limit as i64) as u32)
            }
        };

        Ok(Self { offset, limit })
    }

    /// Limit reported back in the list envelope.
    pub fn effective_limit(&self, total: i64) -> i64 {
        match self.limit {
            Limit::Bounded(n) => n as i64,
            Limit::All => total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QueryConfig {
        QueryConfig::default()
    }

    #[test]
    fn test_empty_params_match_everything() {
        let spec = build_event_filter(&EventQueryParams::default());
        assert!(spec.is_empty());
        let spec = build_visitor_filter(&VisitorQueryParams::default());
        assert!(spec.is_empty());
    }

    #[test]
    fn test_blank_params_are_ignored() {
        let params = EventQueryParams {
            event_type: Some("   ".to_string()),
            q: Some(String::new()),
            ..Default::default()
        };
        assert!(build_event_filter(&params).is_empty());
    }

    #[test]
    fn test_event_filter_conditions() {
        let params = EventQueryParams {
            event_type: Some("login".to_string()),
            user_id: Some("u-1".to_string()),
            from_ts: Some(100),
            q: Some("chrome".to_string()),
            ..Default::default()
        };
        let spec = build_event_filter(&params);
        assert_eq!(
            spec.conditions(),
            &[
                Condition::Equals {
                    field: Field::EventType,
                    value: "login".to_string()
                },
                Condition::Equals {
                    field: Field::UserId,
                    value: "u-1".to_string()
                },
                Condition::Range {
                    field: Field::CreatedAt,
                    from: Some(100),
                    to: None
                },
                Condition::Contains {
                    fields: vec![Field::Payload, Field::UserAgent],
                    needle: "chrome".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_visitor_search_includes_referrer() {
        let params = VisitorQueryParams {
            page: Some("/shen".to_string()),
            q: Some("google".to_string()),
            to_ts: Some(5),
            ..Default::default()
        };
        let spec = build_visitor_filter(&params);
        assert_eq!(spec.conditions().len(), 3);
        assert!(spec.conditions().contains(&Condition::Contains {
            fields: vec![Field::Payload, Field::UserAgent, Field::Referrer],
            needle: "google".to_string(),
        }));
    }

    #[test]
    fn test_visitor_ip_filter_is_canonical() {
        let params = VisitorQueryParams {
            ip: Some(" 2001:0DB8::1 ".to_string()),
            ..Default::default()
        };
        assert_eq!(
            build_visitor_filter(&params).conditions(),
            &[Condition::Equals {
                field: Field::Ip,
                value: "2001:db8::1".to_string()
            }]
        );

        let params = VisitorQueryParams {
            ip: Some("not-an-ip".to_string()),
            ..Default::default()
        };
        assert_eq!(
            build_visitor_filter(&params).conditions(),
            &[Condition::Equals {
                field: Field::Ip,
                value: "not-an-ip".to_string()
            }]
        );
    }

    #[test]
    fn test_pagination_defaults() {
        let p = Pagination::parse(None, None, &config()).unwrap();
        assert_eq!(p.offset, 0);
        assert_eq!(p.limit, Limit::Bounded(50));
    }

    #[test]
    fn test_pagination_clamps_limit() {
        assert_eq!(
            Pagination::parse(None, Some("1000"), &config()).unwrap().limit,
            Limit::Bounded(200)
        );
        assert_eq!(
            Pagination::parse(None, Some("0"), &config()).unwrap().limit,
            Limit::Bounded(1)
        );
        assert_eq!(
            Pagination::parse(None, Some("-4"), &config()).unwrap().limit,
            Limit::Bounded(1)
        );
    }

    #[test]
    fn test_pagination_all_sentinel() {
        let p = Pagination::parse(Some(3), Some("all"), &config()).unwrap();
        assert_eq!(p.limit, Limit::All);
        assert_eq!(p.effective_limit(42), 42);
    }

    #[test]
    fn test_pagination_rejects_bad_input() {
        assert!(matches!(
            Pagination::parse(Some(-1), None, &config()),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            Pagination::parse(None, Some("lots"), &config()),
            Err(AppError::Validation(_))
        ));
    }
}
