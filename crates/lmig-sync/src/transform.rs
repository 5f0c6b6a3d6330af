//! Per-field normalization keyed by semantic data type.
//!
//! Steps are pure and idempotent. The chain picks the first registered step whose
//! `can_handle` accepts the column's data type and role; anything else passes through.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use lmig_core::{CandidateRow, ColumnRole, FieldMap, LegacyRecord, LegacySchema};
use serde_json::{Number, Value as JsonValue};

/// Where a value being transformed came from.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub entity_type: &'a str,
    pub field: &'a str,
    pub role: ColumnRole,
}

pub trait TransformStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, data_type: &str, role: ColumnRole) -> bool;

    /// Must return wrong-shaped input (including `null`) unchanged.
    fn transform(&self, value: JsonValue, ctx: &TransformContext<'_>) -> JsonValue;
}

/// Providers whose mailboxes ignore dots and `+tags` in the local part.
const ALIASING_EMAIL_DOMAINS: &[&str] = &["gmail.com", "googlemail.com"];

pub fn normalize_email(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let Some((local, domain)) = lowered.rsplit_once('@') else {
        return lowered;
    };
    if !ALIASING_EMAIL_DOMAINS.contains(&domain) {
        return lowered;
    }
    let base = local.split('+').next().unwrap_or_default().replace('.', "");
    if base.is_empty() {
        return lowered;
    }
    format!("{base}@{domain}")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmailStep;

impl TransformStep for EmailStep {
    fn name(&self) -> &'static str {
        "email"
    }

    fn can_handle(&self, data_type: &str, _role: ColumnRole) -> bool {
        data_type == "email"
    }

    fn transform(&self, value: JsonValue, _ctx: &TransformContext<'_>) -> JsonValue {
        match value {
            JsonValue::String(s) => JsonValue::String(normalize_email(&s)),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PhoneStep;

impl TransformStep for PhoneStep {
    fn name(&self) -> &'static str {
        "phone"
    }

    fn can_handle(&self, data_type: &str, _role: ColumnRole) -> bool {
        data_type == "phone"
    }

    fn transform(&self, value: JsonValue, _ctx: &TransformContext<'_>) -> JsonValue {
        let JsonValue::String(s) = value else {
            return value;
        };
        let trimmed = s.trim();
        let digits = trimmed
            .chars()
            .filter(char::is_ascii_digit)
            .collect::<String>();
        if digits.is_empty() {
            return JsonValue::String(trimmed.to_string());
        }
        let normalized = if trimmed.starts_with('+') {
            format!("+{digits}")
        } else if let Some(rest) = digits.strip_prefix("00") {
            format!("+{rest}")
        } else {
            digits
        };
        JsonValue::String(normalized)
    }
}

/// Legacy date strings to ISO `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy)]
pub struct DateStep {
    day_first: bool,
}

impl Default for DateStep {
    fn default() -> Self {
        Self { day_first: true }
    }
}

impl DateStep {
    pub fn month_first() -> Self {
        Self { day_first: false }
    }

    fn parse(&self, s: &str) -> Option<NaiveDate> {
        const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];
        const ISO_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];
        const DAY_FIRST: &[&str] = &["%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y"];
        const MONTH_FIRST: &[&str] = &["%m/%d/%Y", "%m.%d.%Y", "%m-%d-%Y"];

        let regional = if self.day_first { DAY_FIRST } else { MONTH_FIRST };
        ISO_FORMATS
            .iter()
            .chain(regional)
            .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
            .or_else(|| {
                DATETIME_FORMATS
                    .iter()
                    .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
                    .map(|dt| dt.date())
            })
    }
}

impl TransformStep for DateStep {
    fn name(&self) -> &'static str {
        "date"
    }

    fn can_handle(&self, data_type: &str, _role: ColumnRole) -> bool {
        data_type == "date"
    }

    fn transform(&self, value: JsonValue, _ctx: &TransformContext<'_>) -> JsonValue {
        match &value {
            JsonValue::String(s) => match self.parse(s.trim()) {
                Some(date) => JsonValue::String(date.format("%Y-%m-%d").to_string()),
                None => value,
            },
            _ => value,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanStep;

impl TransformStep for BooleanStep {
    fn name(&self) -> &'static str {
        "boolean"
    }

    fn can_handle(&self, data_type: &str, _role: ColumnRole) -> bool {
        matches!(data_type, "boolean" | "bool")
    }

    fn transform(&self, value: JsonValue, _ctx: &TransformContext<'_>) -> JsonValue {
        let parsed = match &value {
            JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            JsonValue::Number(n) => match n.as_i64() {
                Some(1) => Some(true),
                Some(0) => Some(false),
                _ => None,
            },
            _ => None,
        };
        parsed.map(JsonValue::Bool).unwrap_or(value)
    }
}

/// Numeric strings such as `"1,234.50"` to JSON numbers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecimalStep;

impl TransformStep for DecimalStep {
    fn name(&self) -> &'static str {
        "decimal"
    }

    fn can_handle(&self, data_type: &str, _role: ColumnRole) -> bool {
        matches!(data_type, "decimal" | "number" | "integer")
    }

    fn transform(&self, value: JsonValue, _ctx: &TransformContext<'_>) -> JsonValue {
        let JsonValue::String(s) = &value else {
            return value;
        };
        if !commas_group_thousands(s) {
            return value;
        }
        let cleaned = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ',' | '_' | ' '))
            .collect::<String>();
        if let Ok(i) = cleaned.parse::<i64>() {
            return JsonValue::Number(i.into());
        }
        match cleaned.parse::<f64>().ok().and_then(Number::from_f64) {
            Some(n) => JsonValue::Number(n),
            None => value,
        }
    }
}

/// True when every `,` sits in the integer part and is followed by exactly three digits, so
/// decimal-comma input such as `1.234,50` is left alone rather than misread.
fn commas_group_thousands(s: &str) -> bool {
    let integer_part = match s.find('.') {
        Some(dot) if s[dot..].contains(',') => return false,
        Some(dot) => &s[..dot],
        None => s,
    };
    integer_part.split(',').skip(1).all(|group| {
        let group = group.trim_end();
        group.len() == 3 && group.bytes().all(|b| b.is_ascii_digit())
    })
}

/// Natural-key strings: trimmed with internal whitespace collapsed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalKeyStep;

impl TransformStep for NaturalKeyStep {
    fn name(&self) -> &'static str {
        "natural_key"
    }

    fn can_handle(&self, data_type: &str, role: ColumnRole) -> bool {
        role == ColumnRole::NaturalKey && matches!(data_type, "string" | "text")
    }

    fn transform(&self, value: JsonValue, _ctx: &TransformContext<'_>) -> JsonValue {
        match value {
            JsonValue::String(s) => {
                JsonValue::String(s.split_whitespace().collect::<Vec<_>>().join(" "))
            }
            other => other,
        }
    }
}

/// Free text: trimmed, blank becomes `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextStep;

impl TransformStep for TextStep {
    fn name(&self) -> &'static str {
        "text"
    }

    fn can_handle(&self, data_type: &str, _role: ColumnRole) -> bool {
        matches!(data_type, "string" | "text")
    }

    fn transform(&self, value: JsonValue, _ctx: &TransformContext<'_>) -> JsonValue {
        match value {
            JsonValue::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    JsonValue::Null
                } else {
                    JsonValue::String(trimmed.to_string())
                }
            }
            other => other,
        }
    }
}

#[derive(Default)]
pub struct TransformChain {
    steps: Vec<Box<dyn TransformStep>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Email, phone, date, boolean, decimal, natural key, text, in that order.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_step(EmailStep)
            .with_step(PhoneStep)
            .with_step(DateStep::default())
            .with_step(BooleanStep)
            .with_step(DecimalStep)
            .with_step(NaturalKeyStep)
            .with_step(TextStep)
    }

    pub fn with_step(mut self, step: impl TransformStep + 'static) -> Self {
        self.register(step);
        self
    }

    pub fn register(&mut self, step: impl TransformStep + 'static) {
        self.steps.push(Box::new(step));
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn step_for(&self, data_type: &str, role: ColumnRole) -> Option<&dyn TransformStep> {
        self.steps
            .iter()
            .find(|s| s.can_handle(data_type, role))
            .map(|s| s.as_ref())
    }

    pub fn apply_field(
        &self,
        data_type: &str,
        value: JsonValue,
        ctx: &TransformContext<'_>,
    ) -> JsonValue {
        match self.step_for(data_type, ctx.role) {
            Some(step) => step.transform(value, ctx),
            None => value,
        }
    }

    /// Normalize every field of `record`, renaming through `field_map` (legacy name -> target name).
    pub fn apply(
        &self,
        entity_type: &str,
        schema: &LegacySchema,
        field_map: &BTreeMap<String, String>,
        record: &LegacyRecord,
    ) -> CandidateRow {
        let mut fields = FieldMap::new();
        for (name, value) in &record.data {
            let target_name = field_map.get(name).cloned().unwrap_or_else(|| name.clone());
            let value = match schema.column(name) {
                Some(column) => {
                    let ctx = TransformContext {
                        entity_type,
                        field: name,
                        role: column.role,
                    };
                    self.apply_field(&column.data_type, value.clone(), &ctx)
                }
                None => value.clone(),
            };
            fields.insert(target_name, value);
        }
        CandidateRow {
            entity_type: entity_type.to_string(),
            legacy_id: record.legacy_id.clone(),
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmig_core::ColumnDef;
    use serde_json::json;

    fn ctx(role: ColumnRole) -> TransformContext<'static> {
        TransformContext {
            entity_type: "customer",
            field: "f",
            role,
        }
    }

    #[test]
    fn email_aliases_are_stripped_only_for_aliasing_providers() {
        assert_eq!(normalize_email("John.Doe@gmail.com"), "johndoe@gmail.com");
        assert_eq!(normalize_email("  j.o.h.n+promo@GoogleMail.com "), "john@googlemail.com");
        assert_eq!(normalize_email("john+tag@company.com"), "john+tag@company.com");
        assert_eq!(normalize_email("First.Last@Company.com"), "first.last@company.com");
        assert_eq!(normalize_email("  NOT-AN-EMAIL "), "not-an-email");
    }

    #[test]
    fn tag_only_local_part_is_kept_whole() {
        assert_eq!(normalize_email("+x@gmail.com"), "+x@gmail.com");
        assert_ne!(normalize_email("+x@gmail.com"), normalize_email("+y@gmail.com"));
        assert_eq!(normalize_email("...@Gmail.com"), "...@gmail.com");
    }

    #[test]
    fn decimal_comma_input_is_left_unchanged() {
        let c = ctx(ColumnRole::Attribute);
        assert_eq!(DecimalStep.transform(json!("1.234,50"), &c), json!("1.234,50"));
        assert_eq!(DecimalStep.transform(json!("3,50"), &c), json!("3,50"));
        assert_eq!(DecimalStep.transform(json!("1,234,567.25"), &c), json!(1234567.25));
        assert_eq!(DecimalStep.transform(json!(" 12,000 "), &c), json!(12000));
    }

    #[test]
    fn email_step_passes_non_strings_through() {
        let step = EmailStep;
        assert_eq!(step.transform(json!(42), &ctx(ColumnRole::Attribute)), json!(42));
        assert_eq!(
            step.transform(JsonValue::Null, &ctx(ColumnRole::Attribute)),
            JsonValue::Null
        );
        assert_eq!(
            step.transform(json!(["a@b.c"]), &ctx(ColumnRole::Attribute)),
            json!(["a@b.c"])
        );
    }

    #[test]
    fn every_default_step_is_idempotent() {
        let cases: Vec<(Box<dyn TransformStep>, JsonValue)> = vec![
            (Box::new(EmailStep), json!(" A.B+x@Gmail.com ")),
            (Box::new(PhoneStep), json!("(020) 555-0100")),
            (Box::new(PhoneStep), json!("0031 20 555 0100")),
            (Box::new(DateStep::default()), json!("31/12/1999")),
            (Box::new(DateStep::default()), json!("2001-02-03 10:11:12")),
            (Box::new(BooleanStep), json!("Yes")),
            (Box::new(DecimalStep), json!("1,234.50")),
            (Box::new(NaturalKeyStep), json!("  ACME   Corp ")),
            (Box::new(TextStep), json!("   ")),
        ];
        for (step, input) in cases {
            let once = step.transform(input.clone(), &ctx(ColumnRole::NaturalKey));
            let twice = step.transform(once.clone(), &ctx(ColumnRole::NaturalKey));
            assert_eq!(once, twice, "step {} not idempotent for {input}", step.name());
        }
    }

    #[test]
    fn specific_normalizations() {
        let c = ctx(ColumnRole::Attribute);
        assert_eq!(PhoneStep.transform(json!("+31 (0)20-555"), &c), json!("+31020555"));
        assert_eq!(PhoneStep.transform(json!("0044 1234"), &c), json!("+441234"));
        assert_eq!(PhoneStep.transform(json!(" n/a "), &c), json!("n/a"));
        assert_eq!(DateStep::default().transform(json!("03.02.2001"), &c), json!("2001-02-03"));
        assert_eq!(DateStep::month_first().transform(json!("02/03/2001"), &c), json!("2001-02-03"));
        assert_eq!(DateStep::default().transform(json!("someday"), &c), json!("someday"));
        assert_eq!(BooleanStep.transform(json!("N"), &c), json!(false));
        assert_eq!(BooleanStep.transform(json!(1), &c), json!(true));
        assert_eq!(BooleanStep.transform(json!("maybe"), &c), json!("maybe"));
        assert_eq!(DecimalStep.transform(json!("1,234"), &c), json!(1234));
        assert_eq!(DecimalStep.transform(json!("12.5"), &c), json!(12.5));
        assert_eq!(DecimalStep.transform(json!("n/a"), &c), json!("n/a"));
        assert_eq!(TextStep.transform(json!("  hi "), &c), json!("hi"));
    }

    #[test]
    fn first_registered_match_wins_and_unmatched_types_pass_through() {
        let chain = TransformChain::with_defaults();
        assert_eq!(
            chain.step_for("string", ColumnRole::NaturalKey).map(|s| s.name()),
            Some("natural_key")
        );
        assert_eq!(
            chain.step_for("string", ColumnRole::Attribute).map(|s| s.name()),
            Some("text")
        );
        assert!(chain.step_for("blob", ColumnRole::Attribute).is_none());

        let reordered = TransformChain::new().with_step(TextStep).with_step(NaturalKeyStep);
        assert_eq!(
            reordered.step_for("string", ColumnRole::NaturalKey).map(|s| s.name()),
            Some("text")
        );
    }

    #[test]
    fn apply_normalizes_by_declared_type_not_column_name() {
        let schema = LegacySchema {
            table_name: "customers".into(),
            columns: vec![
                ColumnDef::new("CONTACT", "email", ColumnRole::NaturalKey),
                ColumnDef::new("email", "string", ColumnRole::Attribute),
                ColumnDef::new("RAW", "blob", ColumnRole::Attribute),
            ],
        };
        let mut data = FieldMap::new();
        data.insert("CONTACT".into(), json!("Jo.Ann@Gmail.com"));
        data.insert("email".into(), json!("  Keep.Case@x.org "));
        data.insert("RAW".into(), json!("  as-is "));
        data.insert("EXTRA".into(), json!(" untouched "));
        let record = LegacyRecord::new("C-1", data);

        let mut field_map = BTreeMap::new();
        field_map.insert("CONTACT".to_string(), "primary_email".to_string());

        let row = TransformChain::with_defaults().apply("customer", &schema, &field_map, &record);
        assert_eq!(row.fields["primary_email"], json!("joann@gmail.com"));
        assert_eq!(row.fields["email"], json!("Keep.Case@x.org"));
        assert_eq!(row.fields["RAW"], json!("  as-is "));
        assert_eq!(row.fields["EXTRA"], json!(" untouched "));
        assert_eq!(row.legacy_id, "C-1");
    }
}
