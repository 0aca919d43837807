//! Search command.

use anyhow::{Result, bail};

use super::files::parse_file_id;
use crate::cli::SearchMode;
use crate::query::{QueryFilter, SearchRequest};
use crate::service::IngestService;

pub struct SearchArgs {
    pub query: Vec<String>,
    pub mode: SearchMode,
    pub file: Option<u32>,
    pub sheet: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub json: bool,
}

pub fn build_request(args: &SearchArgs) -> Result<SearchRequest> {
    let text = args.query.join(" ");
    let filter = match args.mode {
        SearchMode::Part => QueryFilter::PartNumber(text),
        SearchMode::Text => QueryFilter::Text(text),
        SearchMode::Semantic => QueryFilter::Semantic(text),
        SearchMode::Field => {
            let Some((name, value)) = text.split_once('=') else {
                bail!("field search expects column=value");
            };
            QueryFilter::Field {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            }
        }
    };

    let mut request = SearchRequest::new(filter);
    request.file_id = args.file.map(parse_file_id).transpose()?;
    request.sheet = args.sheet.clone();
    request.offset = args.offset;
    request.limit = args.limit;
    Ok(request)
}

pub async fn run_search(service: &IngestService, args: SearchArgs) -> Result<()> {
    let request = build_request(&args)?;
    let page = service.search(request).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    println!(
        "Showing {} of {} matches (offset {})",
        page.hits.len(),
        page.total,
        page.offset
    );
    for hit in &page.hits {
        let part = hit.part_number.as_deref().unwrap_or("-");
        println!(
            "{:.3}  file {} / {} / row {}  [{part}]",
            hit.score, hit.file_id, hit.sheet, hit.row_index
        );
        for (column, value) in &hit.fields {
            println!("        {column}: {value}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(mode: SearchMode, query: &[&str]) -> SearchArgs {
        SearchArgs {
            query: query.iter().map(|q| q.to_string()).collect(),
            mode,
            file: Some(2),
            sheet: None,
            offset: 0,
            limit: Some(5),
            json: false,
        }
    }

    #[test]
    fn test_field_mode_splits_on_equals() {
        let request = build_request(&args(SearchMode::Field, &["Vendor", "=", "Acme", "Corp"])).unwrap();
        assert_eq!(
            request.filter,
            QueryFilter::Field {
                name: "Vendor".to_string(),
                value: "Acme Corp".to_string(),
            }
        );
        assert_eq!(request.file_id.map(|id| id.value()), Some(2));
        assert_eq!(request.limit, Some(5));
    }

    #[test]
    fn test_field_mode_requires_equals() {
        assert!(build_request(&args(SearchMode::Field, &["Vendor"])).is_err());
    }

    #[test]
    fn test_file_zero_rejected() {
        let mut bad = args(SearchMode::Text, &["bolt"]);
        bad.file = Some(0);
        assert!(build_request(&bad).is_err());
    }
}
