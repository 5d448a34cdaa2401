//! Slot analysis and snapshot rendering.
//!
//! The rendered body carries no timestamp, so two cycles that observe the
//! same slots produce the same fingerprint. The observation time only goes
//! into the message header.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};

use crate::model::{Coefficient, Dataset, Item, Location, OptionsReport};

/// Longest message the chat sink accepts.
pub const MAX_MESSAGE_CHARS: usize = 4000;
/// Length kept when a message is truncated.
const TRUNCATED_CHARS: usize = 3900;
const TRUNCATION_MARKER: &str = "\n\n... (message truncated)";

/// A bookable slot for one data set.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub location_id: i64,
    pub location_name: String,
    pub date: String,
    pub coefficient: f64,
    pub box_type: String,
}

impl Slot {
    pub fn is_free(&self) -> bool {
        self.coefficient == 0.0
    }
}

/// Slots one item may use at one location.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationMatch {
    pub location_id: i64,
    pub location_name: String,
    pub packaging: Vec<&'static str>,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemVerdict {
    NoOptions,
    Rejected(String),
    NoLocations,
    Matches(Vec<LocationMatch>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemAnalysis {
    pub item: Item,
    pub verdict: ItemVerdict,
}

/// Analysis of one data set.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetAnalysis {
    pub name: String,
    pub date_range: (String, String),
    pub errors: Vec<String>,
    /// Open slots at the watched locations, before per-item filtering.
    pub slots: Vec<Slot>,
    pub items: Vec<ItemAnalysis>,
}

/// Rendered result of one successful cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Timestamp-free rendering; the fingerprint input.
    pub body: String,
    pub observed_at: DateTime<Utc>,
    pub dataset_count: usize,
    pub datasets_with_slots: usize,
    pub slot_count: usize,
}

impl Snapshot {
    /// The pushed message: header plus body, bounded in length.
    pub fn message(&self) -> String {
        let header = format!(
            "<b>Slot update {}</b>",
            self.observed_at.format("%d.%m.%Y %H:%M UTC")
        );
        truncate_message(format!("{header}\n\n{}", self.body))
    }
}

/// Analyze every data set against the current coefficient listing.
pub fn analyze(
    datasets: &[Dataset],
    locations: &[Location],
    options: &OptionsReport,
    coefficients: &[Coefficient],
) -> Vec<DatasetAnalysis> {
    let by_name: HashMap<String, &Location> = locations
        .iter()
        .map(|l| (l.name.trim().to_lowercase(), l))
        .collect();

    datasets
        .iter()
        .map(|dataset| analyze_dataset(dataset, &by_name, options, coefficients))
        .collect()
}

fn analyze_dataset(
    dataset: &Dataset,
    by_name: &HashMap<String, &Location>,
    options: &OptionsReport,
    coefficients: &[Coefficient],
) -> DatasetAnalysis {
    let mut errors = Vec::new();
    let mut watched = Vec::new();
    for name in &dataset.warehouses {
        match by_name.get(&name.trim().to_lowercase()) {
            Some(location) => watched.push(location.id),
            None => errors.push(format!("unknown location: {name}")),
        }
    }

    let start = parse_bound(&dataset.date_range.0);
    let end = parse_bound(&dataset.date_range.1);

    let slots: Vec<Slot> = coefficients
        .iter()
        .filter(|c| watched.contains(&c.location_id))
        .filter(|c| c.allow_unload)
        .filter(|c| c.coefficient >= 0.0 && c.coefficient <= dataset.max_coefficient)
        .filter(|c| within_range(&c.date, start, end))
        .map(|c| Slot {
            location_id: c.location_id,
            location_name: c.location_name.clone(),
            date: c.date.clone(),
            coefficient: c.coefficient,
            box_type: c.box_type.clone(),
        })
        .collect();

    let items = dataset
        .items
        .iter()
        .map(|item| ItemAnalysis {
            item: item.clone(),
            verdict: item_verdict(item, options, &slots),
        })
        .collect();

    DatasetAnalysis {
        name: dataset.name.clone(),
        date_range: dataset.date_range.clone(),
        errors,
        slots,
        items,
    }
}

fn item_verdict(item: &Item, options: &OptionsReport, slots: &[Slot]) -> ItemVerdict {
    let Some(item_options) = options.for_key(&item.key) else {
        return ItemVerdict::NoOptions;
    };
    if item_options.is_error {
        return ItemVerdict::Rejected(
            item_options
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        );
    }
    if item_options.locations.is_empty() {
        return ItemVerdict::NoLocations;
    }

    let matches = item_options
        .locations
        .iter()
        .filter_map(|option| {
            let packaging = option.box_types();
            let mut matching: Vec<Slot> = slots
                .iter()
                .filter(|s| s.location_id == option.location_id)
                .filter(|s| packaging.contains(&s.box_type.as_str()))
                .cloned()
                .collect();
            if matching.is_empty() {
                return None;
            }
            matching.sort_by(|a, b| a.date.cmp(&b.date));

            Some(LocationMatch {
                location_id: option.location_id,
                location_name: matching[0].location_name.clone(),
                packaging,
                slots: matching,
            })
        })
        .collect();

    ItemVerdict::Matches(matches)
}

/// Parse a date bound as `dd.mm.yyyy` or `yyyy-mm-dd`.
fn parse_bound(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%d.%m.%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

fn slot_date(raw: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .ok()
        .or_else(|| raw.get(..10).and_then(parse_bound))
}

/// Range filtering applies only when both bounds and the slot date parse.
fn within_range(date: &str, start: Option<NaiveDate>, end: Option<NaiveDate>) -> bool {
    match (start, end, slot_date(date)) {
        (Some(start), Some(end), Some(day)) => start <= day && day <= end,
        _ => true,
    }
}

fn format_slot_date(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.format("%d.%m %H:%M").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render analyses into a snapshot observed at `observed_at`.
pub fn render(analyses: &[DatasetAnalysis], observed_at: DateTime<Utc>) -> Snapshot {
    let datasets_with_slots = analyses.iter().filter(|a| !a.slots.is_empty()).count();
    let slot_count: usize = analyses.iter().map(|a| a.slots.len()).sum();

    let mut lines = vec![
        format!("Data sets processed: {}", analyses.len()),
        format!("Data sets with slots: {datasets_with_slots}"),
        format!("Slots found: {slot_count}"),
        String::new(),
    ];

    for analysis in analyses {
        lines.push(format!("<b>{}</b>", escape_html(&analysis.name)));
        lines.push(format!(
            "Period: {} - {}",
            escape_html(or_na(&analysis.date_range.0)),
            escape_html(or_na(&analysis.date_range.1))
        ));
        if !analysis.errors.is_empty() {
            lines.push(format!("Errors: {}", escape_html(&analysis.errors.join("; "))));
        }
        if analysis.items.is_empty() {
            lines.push("   No items to watch".to_string());
        }

        for item in &analysis.items {
            render_item(&mut lines, item);
        }
        lines.push(String::new());
    }

    Snapshot {
        body: lines.join("\n"),
        observed_at,
        dataset_count: analyses.len(),
        datasets_with_slots,
        slot_count,
    }
}

fn render_item(lines: &mut Vec<String>, analysis: &ItemAnalysis) {
    lines.push(format!(
        "<b>{}</b> (qty {})",
        escape_html(&analysis.item.key),
        analysis.item.quantity
    ));

    let matches = match &analysis.verdict {
        ItemVerdict::NoOptions => {
            lines.push("   No acceptance options".to_string());
            return;
        }
        ItemVerdict::Rejected(reason) => {
            lines.push(format!("   Error: {}", escape_html(reason)));
            return;
        }
        ItemVerdict::NoLocations => {
            lines.push("   No locations accept this item".to_string());
            return;
        }
        ItemVerdict::Matches(matches) => matches,
    };

    if matches.is_empty() {
        lines.push("   No open slots at accepting locations".to_string());
        return;
    }

    for location in matches {
        lines.push(format!(
            "   <b>{}</b> (ID: {})",
            escape_html(&location.location_name),
            location.location_id
        ));
        lines.push(format!("      Packaging: {}", location.packaging.join(", ")));

        let mut by_date: BTreeMap<&str, Vec<&Slot>> = BTreeMap::new();
        for slot in &location.slots {
            by_date.entry(slot.date.as_str()).or_default().push(slot);
        }
        for (date, slots) in by_date {
            for slot in slots {
                let cost = if slot.is_free() {
                    "<b>free</b>".to_string()
                } else {
                    format!("x{}", slot.coefficient)
                };
                lines.push(format!(
                    "      {} ({}): {cost}",
                    format_slot_date(date),
                    escape_html(&slot.box_type)
                ));
            }
        }
    }
}

fn or_na(value: &str) -> &str {
    if value.trim().is_empty() {
        "N/A"
    } else {
        value
    }
}

/// Bound a message to `MAX_MESSAGE_CHARS`.
///
/// Rendered lines never split a tag, so the cut falls on the last line break
/// before `TRUNCATED_CHARS`. A message without one is cut on a char boundary,
/// then any partial tag or entity is dropped and an open `<b>` is closed.
pub fn truncate_message(message: String) -> String {
    if message.chars().count() <= MAX_MESSAGE_CHARS {
        return message;
    }
    let limit = message
        .char_indices()
        .nth(TRUNCATED_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(message.len());
    let head = &message[..limit];
    let kept = match head.rfind('\n') {
        Some(newline) => head[..newline].trim_end(),
        None => head,
    };
    format!("{}{TRUNCATION_MARKER}", balance_markup(kept))
}

fn balance_markup(text: &str) -> String {
    let mut text = text;
    if let Some(open) = text.rfind('<') {
        if !text[open..].contains('>') {
            text = &text[..open];
        }
    }
    if let Some(amp) = text.rfind('&') {
        if !text[amp..].contains(';') {
            text = &text[..amp];
        }
    }

    let mut balanced = text.to_string();
    if balanced.matches("<b>").count() > balanced.matches("</b>").count() {
        balanced.push_str("</b>");
    }
    balanced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemOptions, LocationOption, BOX_TYPE_BOXES, BOX_TYPE_MONOPALLET};
    use chrono::TimeZone;

    fn dataset() -> Dataset {
        Dataset {
            name: "Main".into(),
            warehouses: vec!["коледино".into(), "Nowhere".into()],
            date_range: ("01.08.2025".into(), "10.08.2025".into()),
            items: vec![
                Item {
                    key: "111".into(),
                    quantity: 4,
                },
                Item {
                    key: "222".into(),
                    quantity: 1,
                },
            ],
            max_coefficient: 1.0,
        }
    }

    fn locations() -> Vec<Location> {
        vec![
            Location {
                id: 507,
                name: "Коледино".into(),
            },
            Location {
                id: 1,
                name: "Other".into(),
            },
        ]
    }

    fn coefficient(location_id: i64, date: &str, value: f64, box_type: &str) -> Coefficient {
        Coefficient {
            location_id,
            location_name: "Коледино".into(),
            date: date.into(),
            coefficient: value,
            allow_unload: true,
            box_type: box_type.into(),
        }
    }

    fn options() -> OptionsReport {
        OptionsReport {
            result: vec![
                ItemOptions {
                    key: "111".into(),
                    is_error: false,
                    error: None,
                    locations: vec![LocationOption {
                        location_id: 507,
                        can_box: true,
                        ..Default::default()
                    }],
                },
                ItemOptions {
                    key: "222".into(),
                    is_error: true,
                    error: Some("bad barcode".into()),
                    locations: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_slot_filtering() {
        let mut closed = coefficient(507, "2025-08-03T00:00:00Z", 0.0, BOX_TYPE_BOXES);
        closed.allow_unload = false;

        let coefficients = vec![
            coefficient(507, "2025-08-02T00:00:00Z", 0.0, BOX_TYPE_BOXES),
            coefficient(507, "2025-08-04T00:00:00Z", 1.0, BOX_TYPE_MONOPALLET),
            coefficient(507, "2025-08-05T00:00:00Z", 5.0, BOX_TYPE_BOXES),
            coefficient(507, "2025-08-06T00:00:00Z", -1.0, BOX_TYPE_BOXES),
            coefficient(507, "2025-09-01T00:00:00Z", 0.0, BOX_TYPE_BOXES),
            coefficient(1, "2025-08-02T00:00:00Z", 0.0, BOX_TYPE_BOXES),
            closed,
        ];

        let analyses = analyze(&[dataset()], &locations(), &options(), &coefficients);
        let analysis = &analyses[0];

        assert_eq!(analysis.errors, vec!["unknown location: Nowhere"]);
        assert_eq!(analysis.slots.len(), 2);

        match &analysis.items[0].verdict {
            ItemVerdict::Matches(matches) => {
                assert_eq!(matches.len(), 1);
                assert_eq!(matches[0].slots.len(), 1);
                assert_eq!(matches[0].slots[0].box_type, BOX_TYPE_BOXES);
            }
            other => panic!("unexpected verdict {other:?}"),
        }
        assert_eq!(
            analysis.items[1].verdict,
            ItemVerdict::Rejected("bad barcode".into())
        );
    }

    #[test]
    fn test_unparsable_bounds_do_not_filter() {
        let mut data = dataset();
        data.date_range = ("soon".into(), String::new());
        let coefficients = vec![coefficient(507, "2030-01-01T00:00:00Z", 0.0, BOX_TYPE_BOXES)];

        let analyses = analyze(&[data], &locations(), &options(), &coefficients);
        assert_eq!(analyses[0].slots.len(), 1);
    }

    #[test]
    fn test_iso_bounds() {
        assert_eq!(
            parse_bound("2025-08-01"),
            NaiveDate::from_ymd_opt(2025, 8, 1)
        );
        assert_eq!(
            parse_bound(" 01.08.2025 "),
            NaiveDate::from_ymd_opt(2025, 8, 1)
        );
        assert_eq!(parse_bound("tomorrow"), None);
    }

    #[test]
    fn test_body_is_independent_of_observation_time() {
        let coefficients = vec![coefficient(507, "2025-08-02T00:00:00Z", 0.0, BOX_TYPE_BOXES)];
        let analyses = analyze(&[dataset()], &locations(), &options(), &coefficients);

        let a = render(&analyses, Utc.with_ymd_and_hms(2025, 8, 1, 10, 0, 0).unwrap());
        let b = render(&analyses, Utc.with_ymd_and_hms(2025, 8, 1, 10, 5, 0).unwrap());

        assert_eq!(a.body, b.body);
        assert_ne!(a.message(), b.message());
        assert_eq!(a.slot_count, 1);
        assert_eq!(a.datasets_with_slots, 1);
        assert!(a.body.contains("<b>free</b>"));
        assert!(a.message().starts_with("<b>Slot update 01.08.2025 10:00 UTC</b>"));
    }

    #[test]
    fn test_names_are_escaped() {
        let mut data = dataset();
        data.name = "A&B <test>".into();
        let snapshot = render(&analyze(&[data], &[], &OptionsReport::default(), &[]), Utc::now());
        assert!(snapshot.body.contains("<b>A&amp;B &lt;test&gt;</b>"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long = "ж".repeat(MAX_MESSAGE_CHARS + 10);
        let truncated = truncate_message(long);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            truncated.chars().count(),
            TRUNCATED_CHARS + TRUNCATION_MARKER.chars().count()
        );

        let short = "short".to_string();
        assert_eq!(truncate_message(short.clone()), short);
    }

    fn assert_well_formed(message: &str) {
        assert_eq!(
            message.matches("<b>").count(),
            message.matches("</b>").count(),
            "unbalanced tags in {message:?}"
        );
        let body = message.trim_end_matches(TRUNCATION_MARKER);
        if let Some(open) = body.rfind('<') {
            assert!(body[open..].contains('>'), "dangling tag in {body:?}");
        }
        if let Some(amp) = body.rfind('&') {
            assert!(body[amp..].contains(';'), "dangling entity in {body:?}");
        }
    }

    #[test]
    fn test_truncation_keeps_markup_intact_at_every_offset() {
        for pad in 0..40 {
            let mut message = "x".repeat(pad);
            let mut n = 0;
            while message.chars().count() <= MAX_MESSAGE_CHARS + 1000 {
                message.push_str(&format!("\n   <b>Коледино &amp; Co {n}</b> (ID: 507)"));
                n += 1;
            }

            let truncated = truncate_message(message);
            assert!(truncated.chars().count() <= MAX_MESSAGE_CHARS);
            assert!(truncated.ends_with(TRUNCATION_MARKER));
            assert!(truncated.trim_end_matches(TRUNCATION_MARKER).ends_with("(ID: 507)"));
            assert_well_formed(&truncated);
        }
    }

    #[test]
    fn test_truncation_without_line_breaks_drops_partial_markup() {
        let prefix = "ж".repeat(TRUNCATED_CHARS - 6);
        let message = format!("{prefix}<b>A &amp; B</b>{}", "z".repeat(200));
        let truncated = truncate_message(message);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert_well_formed(&truncated);
    }
}
