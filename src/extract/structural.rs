//! Selector-driven extraction.
//!
//! A [`SelectorSchema`] names one base selector matching each product card and
//! a list of field selectors evaluated inside every card. Cards that lack a
//! name or a price are skipped; every other field is optional.

use crate::error::ExtractionFailure;
use crate::fetch::Document;
use crate::models::RawRecord;
use crate::sources::{Field, FieldKind, FieldSpec, SelectorSchema};
use crate::utils::collapse_whitespace;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};

fn parse_selector(selector: &str) -> Result<Selector, ExtractionFailure> {
    Selector::parse(selector).map_err(|e| ExtractionFailure::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// A field spec with its selector compiled once per document.
struct CompiledField<'a> {
    spec: &'a FieldSpec,
    selector: Option<Selector>,
}

enum FieldValue {
    Text(String),
    Flag(bool),
}

impl CompiledField<'_> {
    fn read(&self, item: ElementRef<'_>) -> Option<FieldValue> {
        let target = match &self.selector {
            None => Some(item),
            Some(selector) => item.select(selector).next(),
        };
        match self.spec.kind {
            FieldKind::Exists => Some(FieldValue::Flag(target.is_some())),
            FieldKind::Text => {
                let text = collapse_whitespace(&target?.text().collect::<String>());
                (!text.is_empty()).then_some(FieldValue::Text(text))
            }
            FieldKind::Attribute => {
                let name = self.spec.attribute.as_deref()?;
                let value = target?.value().attr(name)?.trim();
                (!value.is_empty()).then(|| FieldValue::Text(value.to_string()))
            }
        }
    }
}

/// Availability text such as "Out of stock" or "Add to cart".
fn availability_from_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    !["out of stock", "unavailable", "sold out", "not available"]
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn apply(record: &mut RawRecord, field: Field, value: FieldValue) {
    let text = match value {
        FieldValue::Flag(flag) => {
            if field == Field::InStock {
                record.in_stock = Some(flag);
            }
            return;
        }
        FieldValue::Text(text) => text,
    };
    match field {
        Field::Name => record.name = Some(text),
        Field::Price => record.price_text = Some(text),
        Field::OriginalPrice => record.original_price_text = Some(text),
        Field::Url => record.product_url = Some(text),
        Field::ImageUrl => record.image_url = Some(text),
        Field::InStock => record.in_stock = Some(availability_from_text(&text)),
        Field::ItemKey => record.item_key = Some(text),
        Field::Brand => record.brand = Some(text),
        Field::Description => record.description = Some(text),
    }
}

/// Apply `schema` to `document`, returning one record per complete card.
#[instrument(level = "debug", skip_all, fields(url = %document.url, base = %schema.base))]
pub fn extract_structural(
    document: &Document,
    schema: &SelectorSchema,
) -> Result<Vec<RawRecord>, ExtractionFailure> {
    let base = parse_selector(&schema.base)?;
    let fields = schema
        .fields
        .iter()
        .map(|spec| {
            let selector = spec.selector.as_deref().map(parse_selector).transpose()?;
            Ok(CompiledField { spec, selector })
        })
        .collect::<Result<Vec<_>, ExtractionFailure>>()?;

    let html = Html::parse_document(&document.html);
    let mut cards = 0usize;
    let mut records = Vec::new();
    for item in html.select(&base) {
        cards += 1;
        let mut record = RawRecord::default();
        for field in &fields {
            if let Some(value) = field.read(item) {
                apply(&mut record, field.spec.field, value);
            }
        }
        if record.has_required_fields() {
            records.push(record);
        }
    }
    debug!(cards, records = records.len(), "Structural extraction finished");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceRegistry;

    fn doc(html: &str) -> Document {
        Document {
            url: "https://www.cvs.com/search?searchTerm=women+health+test".to_string(),
            html: html.to_string(),
        }
    }

    const CVS_PAGE: &str = r#"
        <html><body>
          <div class="product-card">
            <a class="product-link" href="/shop/first-response-early-result">
              <span class="product-title">  First Response
                 Early Result Pregnancy Test, 3 ct </span>
            </a>
            <div class="price"><span class="value">$22.99</span><span class="strike">$26.99</span></div>
            <img class="product-image" src="https://img.cvs.com/fr.jpg">
            <button class="add-to-cart">Add</button>
          </div>
          <div class="product-card">
            <span class="product-title">Clearblue Ovulation Test</span>
            <div class="price"><span class="value">$39.99</span></div>
          </div>
          <div class="product-card">
            <span class="product-title">Card without a price</span>
          </div>
        </body></html>
    "#;

    #[test]
    fn test_extracts_complete_cards_only() {
        let registry = SourceRegistry::builtin().unwrap();
        let schema = registry.get("CVS").unwrap().schema.selectors.clone().unwrap();
        let records = extract_structural(&doc(CVS_PAGE), &schema).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.name.as_deref(), Some("First Response Early Result Pregnancy Test, 3 ct"));
        assert_eq!(first.price_text.as_deref(), Some("$22.99"));
        assert_eq!(first.original_price_text.as_deref(), Some("$26.99"));
        assert_eq!(first.product_url.as_deref(), Some("/shop/first-response-early-result"));
        assert_eq!(first.image_url.as_deref(), Some("https://img.cvs.com/fr.jpg"));
        assert_eq!(first.in_stock, Some(true));

        let second = &records[1];
        assert_eq!(second.original_price_text, None);
        assert_eq!(second.product_url, None);
        assert_eq!(second.in_stock, Some(false));
    }

    #[test]
    fn test_item_level_attribute() {
        let registry = SourceRegistry::builtin().unwrap();
        let schema = registry.get("Amazon").unwrap().schema.selectors.clone().unwrap();
        let html = r#"
            <div data-component-type="s-search-result" data-asin="B0C1234XYZ">
              <h2><a href="/dp/B0C1234XYZ"><span>Proov Complete Fertility Kit</span></a></h2>
              <span class="a-price"><span class="a-offscreen">$49.99</span></span>
            </div>
        "#;
        let records = extract_structural(&doc(html), &schema).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_key.as_deref(), Some("B0C1234XYZ"));
        assert_eq!(records[0].product_url.as_deref(), Some("/dp/B0C1234XYZ"));
    }

    #[test]
    fn test_availability_text_field() {
        let schema: SelectorSchema = serde_yaml::from_str(
            r#"
base: .tile
fields:
  - { field: name, selector: .n }
  - { field: price, selector: .p }
  - { field: in_stock, selector: .stock }
"#,
        )
        .unwrap();
        let html = r#"
            <div class="tile"><b class="n">A</b><i class="p">$5</i><em class="stock">Out of Stock</em></div>
            <div class="tile"><b class="n">B</b><i class="p">$6</i><em class="stock">Ships today</em></div>
        "#;
        let records = extract_structural(&doc(html), &schema).unwrap();
        assert_eq!(records[0].in_stock, Some(false));
        assert_eq!(records[1].in_stock, Some(true));
    }

    #[test]
    fn test_no_matches_is_empty_not_error() {
        let registry = SourceRegistry::builtin().unwrap();
        let schema = registry.get("Target").unwrap().schema.selectors.clone().unwrap();
        let records = extract_structural(&doc("<html><body><p>Redesigned!</p></body></html>"), &schema)
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_invalid_selector_is_failure() {
        let schema = SelectorSchema {
            base: "div[".to_string(),
            fields: vec![],
        };
        let err = extract_structural(&doc("<div></div>"), &schema).unwrap_err();
        assert!(matches!(err, ExtractionFailure::InvalidSelector { .. }));
    }
}
