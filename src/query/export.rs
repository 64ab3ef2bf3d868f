use crate::error::{AppError, AppResult};
use crate::query::filter::FilterSpec;
use crate::storage::collection::{Collection, Record};
use crate::types::{VisitorEvent, WebhookEvent};
use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::json;
use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn parse(fmt: Option<&str>) -> AppResult<Self> {
        match fmt.map(str::trim) {
            None | Some("") | Some("json") => Ok(ExportFormat::Json),
            Some("csv") => Ok(ExportFormat::Csv),
            Some(other) => Err(AppError::Validation(format!(
                "unsupported format: {other}; expected 'json' or 'csv'"
            ))),
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv; charset=utf-8",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

/// How a record is presented in list responses and exports.
pub trait ExportRow {
    fn csv_header(include_payload: bool) -> Vec<&'static str>;
    fn csv_record(&self, include_payload: bool) -> Vec<String>;
    fn json_item(&self, include_payload: bool) -> AppResult<serde_json::Value>;
}

impl ExportRow for WebhookEvent {
    fn csv_header(_include_payload: bool) -> Vec<&'static str> {
        vec!["id", "type", "user_id", "ip", "user_agent", "payload", "created_at"]
    }

    fn csv_record(&self, _include_payload: bool) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.event_type.clone(),
            self.user_id.clone().unwrap_or_default(),
            self.ip.clone().unwrap_or_default(),
            self.user_agent.clone().unwrap_or_default(),
            self.payload.to_string(),
            self.created_at.to_string(),
        ]
    }

    fn json_item(&self, _include_payload: bool) -> AppResult<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| AppError::Internal(format!("json encode failed: {e}")))
    }
}

impl ExportRow for VisitorEvent {
    fn csv_header(include_payload: bool) -> Vec<&'static str> {
        let mut header = vec!["id", "path", "ip", "created_at"];
        if include_payload {
            header.extend(["user_agent", "ref", "visitor_info"]);
        }
        header
    }

    fn csv_record(&self, include_payload: bool) -> Vec<String> {
        let mut record = vec![
            self.id.to_string(),
            self.page.clone(),
            self.ip.clone().unwrap_or_default(),
            self.created_at.to_string(),
        ];
        if include_payload {
            record.push(self.user_agent.clone().unwrap_or_default());
            record.push(self.referrer.clone().unwrap_or_default());
            record.push(self.visitor_info().to_string());
        }
        record
    }

    fn json_item(&self, include_payload: bool) -> AppResult<serde_json::Value> {
        let mut item = json!({
            "id": self.id,
            "path": self.page,
            "ip": self.ip,
            "hits": self.hits,
            "created_at": self.created_at,
        });
        if include_payload {
            item["ref"] = json!(self.referrer);
            item["user_agent"] = json!(self.user_agent);
            item["visitor_info"] = self.visitor_info();
        }
        Ok(item)
    }
}

/// Spreadsheet apps treat cells starting with `=`, `+`, `-`, `@`, TAB or CR as formulas;
/// a leading `'` makes them literal.
fn sanitize_csv_field(val: &str) -> Cow<'_, str> {
    if val.starts_with(['=', '+', '-', '@', '\t', '\r']) {
        Cow::Owned(format!("'{val}"))
    } else {
        Cow::Borrowed(val)
    }
}

fn csv_chunk<R: ExportRow>(
    header: Option<Vec<&'static str>>,
    rows: &[R],
    include_payload: bool,
) -> AppResult<Bytes> {
    let mut wtr = csv::Writer::from_writer(Vec::with_capacity(rows.len().saturating_mul(128)));
    if let Some(header) = header {
        wtr.write_record(header)
            .map_err(|e| AppError::Internal(format!("csv write_record failed: {e}")))?;
    }
    for row in rows {
        let record = row.csv_record(include_payload);
        wtr.write_record(record.iter().map(|field| sanitize_csv_field(field).into_owned()))
            .map_err(|e| AppError::Internal(format!("csv write_record failed: {e}")))?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| AppError::Internal(format!("csv flush failed: {e}")))?;
    Ok(Bytes::from(bytes))
}

/// Comma-separated JSON items; `first` tracks whether a separator is needed across batches.
fn json_chunk<R: ExportRow>(
    rows: &[R],
    include_payload: bool,
    first: &mut bool,
) -> AppResult<Bytes> {
    let mut buf = Vec::new();
    for row in rows {
        if !*first {
            buf.push(b',');
        }
        *first = false;
        serde_json::to_writer(&mut buf, &row.json_item(include_payload)?)
            .map_err(|e| AppError::Internal(format!("json encode failed: {e}")))?;
    }
    Ok(Bytes::from(buf))
}

/// Stream every record matching `filter` as a JSON array or CSV attachment.
///
/// The first batch is fetched before the response starts so an unreachable store
/// still produces a regular error response rather than a truncated body.
pub async fn export_response<R>(
    collection: &Collection<R>,
    filter: FilterSpec,
    format: ExportFormat,
    include_payload: bool,
    batch_size: usize,
    filename_stem: &str,
) -> AppResult<Response>
where
    R: Record + ExportRow,
{
    let mut batches = Box::pin(collection.export(filter, batch_size));
    let first = batches.try_next().await?;
    let batches = stream::iter(first.map(Ok::<_, AppError>)).chain(batches);

    let body: BoxStream<'static, AppResult<Bytes>> = match format {
        ExportFormat::Csv => {
            let header = csv_chunk::<R>(Some(R::csv_header(include_payload)), &[], include_payload);
            stream::once(future::ready(header))
                .chain(batches.map(move |batch| {
                    batch.and_then(|rows| csv_chunk(None, &rows, include_payload))
                }))
                .boxed()
        }
        ExportFormat::Json => {
            let mut first = true;
            stream::once(future::ready(Ok(Bytes::from_static(b"["))))
                .chain(batches.map(move |batch| {
                    batch.and_then(|rows| json_chunk(&rows, include_payload, &mut first))
                }))
                .chain(stream::once(future::ready(Ok(Bytes::from_static(b"]")))))
                .boxed()
        }
    };

    let body = body.map_err(|e| {
        tracing::error!(error = %e, "export aborted mid-stream");
        std::io::Error::other(e.to_string())
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, format.content_type())
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{filename_stem}.{}\"",
                format.extension()
            ),
        )
        .body(Body::from_stream(body))
        .map_err(|e| AppError::Internal(format!("response build failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> WebhookEvent {
        WebhookEvent {
            id: 7,
            event_type: "login".to_string(),
            user_id: None,
            ip: Some("1.2.3.4".to_string()),
            user_agent: Some("=HYPERLINK(\"x\")".to_string()),
            payload: json!({"type": "login", "data": {"a": 1}}),
            created_at: 1_700_000_000,
        }
    }

    fn visitor() -> VisitorEvent {
        VisitorEvent {
            id: 3,
            page: "/shen".to_string(),
            referrer: Some("https://ref.example".to_string()),
            ip: None,
            user_agent: Some("curl/8".to_string()),
            payload: json!({"path": "/shen", "data": {"meta": {"city": "Lahore"}}}),
            created_at: 10,
            hits: 2,
        }
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(ExportFormat::parse(None).unwrap(), ExportFormat::Json);
        assert_eq!(ExportFormat::parse(Some("csv")).unwrap(), ExportFormat::Csv);
        assert!(matches!(
            ExportFormat::parse(Some("xml")),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_event_csv_columns_and_sanitizing() {
        let bytes = csv_chunk(Some(WebhookEvent::csv_header(false)), &[event()], false).unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id,type,user_id,ip,user_agent,payload,created_at"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("7,login,,1.2.3.4,"));
        assert!(row.contains("'=HYPERLINK"), "formula should be neutralized: {row}");
        assert!(row.ends_with(",1700000000"));
    }

    #[test]
    fn test_visitor_csv_payload_columns() {
        assert_eq!(VisitorEvent::csv_header(false), vec!["id", "path", "ip", "created_at"]);
        let record = visitor().csv_record(true);
        assert_eq!(record.len(), 7);
        assert_eq!(record[1], "/shen");
        assert_eq!(record[2], "");
        assert_eq!(record[6], r#"{"city":"Lahore"}"#);
    }

    #[test]
    fn test_visitor_json_item() {
        let item = visitor().json_item(false).unwrap();
        assert_eq!(item["path"], "/shen");
        assert!(item.get("visitor_info").is_none());

        let item = visitor().json_item(true).unwrap();
        assert_eq!(item["visitor_info"]["city"], "Lahore");
        assert_eq!(item["ref"], "https://ref.example");
    }

    #[test]
    fn test_event_json_item() {
        let item = event().json_item(false).unwrap();
        assert_eq!(item["id"], 7);
        assert_eq!(item["type"], "login");
        assert_eq!(item["ip"], "1.2.3.4");
        assert!(item["user_id"].is_null());
        assert_eq!(item["created_at"], 1_700_000_000);
    }

    #[test]
    fn test_json_chunks_join_across_batches() {
        let mut first = true;
        let a = json_chunk(&[visitor()], false, &mut first).unwrap();
        let b = json_chunk(&[visitor()], false, &mut first).unwrap();
        let joined = format!(
            "[{}{}]",
            String::from_utf8(a.to_vec()).unwrap(),
            String::from_utf8(b.to_vec()).unwrap()
        );
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&joined).unwrap();
        assert_eq!(parsed.len(), 2);
    }
}
