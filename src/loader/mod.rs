//! Offline ingestion of FMP JSON dumps and EOD CSV exports.

use crate::fmp::cleaner::{clean_dividend_rows, clean_eod_rows, parse_date};
use crate::models::{
    DailyBar, Dividend, IndexComponent, RawCompositionRow, RawDividendHistory, RawEodRow,
    RawPriceHistory,
};
use crate::utils::normalise_symbol;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Extract symbol from a filename such as `AAPL.json` or `msft_eod.csv`.
pub fn extract_symbol_from_filename(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let symbol = normalise_symbol(stem.split(['_', ' ']).next()?);

    if symbol.is_empty() { None } else { Some(symbol) }
}

/// The body's `symbol` wins; the filename is the fallback.
fn resolve_symbol(body_symbol: Option<&str>, path: &Path) -> Result<String> {
    body_symbol
        .map(normalise_symbol)
        .filter(|s| !s.is_empty())
        .or_else(|| extract_symbol_from_filename(path))
        .with_context(|| format!("No symbol in body or filename {:?}", path))
}

/// Load a `historical-price-full` JSON body or an EOD CSV with
/// `date,open,high,low,close,adjClose,volume,…` headers.
pub fn load_price_file(path: &Path) -> Result<(String, Vec<DailyBar>)> {
    let now = Utc::now().naive_utc();

    let (symbol, rows) = if has_extension(path, "json") {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;
        let body: RawPriceHistory = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parse {:?}", path))?;
        (resolve_symbol(body.symbol.as_deref(), path)?, body.historical)
    } else {
        let symbol = resolve_symbol(None, path)?;
        (symbol, read_eod_csv(path)?)
    };

    debug!("Loading {} from {:?}", symbol, path);
    let bars = clean_eod_rows(&symbol, &rows, now);
    info!("{}: {} bars loaded ({} rows read)", symbol, bars.len(), rows.len());
    Ok((symbol, bars))
}

fn read_eod_csv(path: &Path) -> Result<Vec<RawEodRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut rows = Vec::new();
    for (i, result) in reader.deserialize::<RawEodRow>().enumerate() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => warn!("Row {} in {:?}: {}", i + 1, path, e),
        }
    }
    Ok(rows)
}

/// Load a `historical-price-full/stock_dividend` JSON body.
pub fn load_dividend_file(path: &Path) -> Result<(String, Vec<Dividend>)> {
    let file = File::open(path).with_context(|| format!("open {:?}", path))?;
    let body: RawDividendHistory = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parse {:?}", path))?;
    let symbol = resolve_symbol(body.symbol.as_deref(), path)?;

    let dividends = clean_dividend_rows(&symbol, &body.historical, Utc::now().naive_utc());
    info!("{}: {} dividends loaded", symbol, dividends.len());
    Ok((symbol, dividends))
}

/// Load a STOXX-style composition export (`;` or `,` separated).
///
/// Members are keyed by ISIN upstream; `resolve` maps each ISIN to a stored
/// listing. Rows without a positive rank, a creation date or a resolvable ISIN
/// are skipped.
pub fn load_composition_file<F>(path: &Path, mut resolve: F) -> Result<Vec<IndexComponent>>
where
    F: FnMut(&str) -> Result<Option<String>>,
{
    let mut header = String::new();
    BufReader::new(File::open(path).with_context(|| format!("open {:?}", path))?)
        .read_line(&mut header)?;
    let delimiter = if header.matches(';').count() > header.matches(',').count() { b';' } else { b',' };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let now = Utc::now().naive_utc();
    let mut components = Vec::new();
    let mut unresolved = 0usize;

    for (i, result) in reader.deserialize::<RawCompositionRow>().enumerate() {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                warn!("Row {} in {:?}: {}", i + 1, path, e);
                continue;
            }
        };

        let Some(isin) = row.isin.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            continue;
        };
        let Some(as_of) = row.creation_date.as_deref().and_then(parse_date) else {
            warn!("Row {} in {:?}: bad creation date {:?}", i + 1, path, row.creation_date);
            continue;
        };
        let rank = row.rank.as_deref().and_then(parse_rank).filter(|r| *r > 0);
        let (Some(rank), Some(index_symbol)) = (rank, row.index_symbol.as_deref()) else {
            continue;
        };

        let Some(symbol) = resolve(isin)? else {
            debug!("{}: no listing for {}", index_symbol, isin);
            unresolved += 1;
            continue;
        };

        components.push(IndexComponent {
            index_symbol: normalise_symbol(index_symbol),
            symbol,
            as_of,
            index_name: row.index_name.clone(),
            index_isin: row.index_isin.clone(),
            isin: Some(isin.to_string()),
            rank: Some(rank),
            sector: None,
            date_first_added: None,
            fetched_at: now,
        });
    }

    if unresolved > 0 {
        warn!("{:?}: {} ISINs without a stored profile", path, unresolved);
    }
    info!("{:?}: {} index components", path, components.len());
    Ok(components)
}

/// `"12"`, `"12.0"` and `"n/a"` (→ `None`)
fn parse_rank(s: &str) -> Option<i32> {
    let s = s.trim();
    s.parse::<i32>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i32))
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// Files in `dir` (not recursive) with one of `exts`, sorted by name.
pub fn discover_files(dir: &Path, exts: &[&str]) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && exts.iter().any(|ext| has_extension(&path, ext)) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
