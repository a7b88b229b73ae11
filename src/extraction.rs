/// Source table extraction
///
/// Turns raw page markup into `RawRow`s. The upstream page layout is not
/// stable, so selection is two-step:
/// 1. First table whose text matches the selection pattern
/// 2. Otherwise (if enabled) the table with the most cells
use crate::config::TableSelection;
use crate::errors::ExtractionError;
use crate::models::RawRow;
use scraper::{ElementRef, Html, Node, Selector};
use std::sync::LazyLock;

// Constant, valid CSS selectors; `Selector::parse` cannot fail on them.
static TABLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("valid table selector"));
static ROW_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tr").expect("valid row selector"));

/// Upper bound for `rowspan`/`colspan`, matching what browsers honour.
const MAX_SPAN: usize = 1000;

/// A table reduced to header texts and data row cell texts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedTable {
    text: String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl ParsedTable {
    fn cell_count(&self) -> usize {
        self.rows.len() * self.headers.len()
    }
}

/// Extracts the museum table from `markup`.
///
/// Fails with `NoMatchingTable` when no table can be selected and with
/// `MalformedTable` when the selected table has no header or no data rows.
pub fn extract_table(
    markup: &str,
    selection: &TableSelection,
) -> Result<Vec<RawRow>, ExtractionError> {
    let document = Html::parse_document(markup);
    let tables: Vec<ParsedTable> = document.select(&TABLE_SELECTOR).map(parse_table).collect();

    if tables.is_empty() {
        tracing::error!("No tables found in markup ({} bytes)", markup.len());
        return Err(ExtractionError::no_matching_table(
            "markup contains no tables",
        ));
    }

    let table = match tables
        .iter()
        .find(|t| selection.pattern.is_match(&t.text))
    {
        Some(table) => {
            tracing::info!(
                "Found table matching pattern '{}' ({} rows)",
                selection.pattern.as_str(),
                table.rows.len()
            );
            table
        }
        None if selection.fallback_to_largest => {
            tracing::warn!(
                "No table matches '{}'. Falling back to the largest of {} tables",
                selection.pattern.as_str(),
                tables.len()
            );
            // max_by_key keeps the last maximum; reverse so ties go to the first table
            tables
                .iter()
                .rev()
                .max_by_key(|t| t.cell_count())
                .ok_or_else(|| ExtractionError::no_matching_table("markup contains no tables"))?
        }
        None => {
            return Err(ExtractionError::no_matching_table(format!(
                "no table matches '{}'",
                selection.pattern.as_str()
            )));
        }
    };

    if table.headers.is_empty() {
        return Err(ExtractionError::malformed_table(
            "selected table has no header row",
        ));
    }
    if table.rows.is_empty() {
        return Err(ExtractionError::malformed_table(
            "selected table has no data rows",
        ));
    }

    let rows: Vec<RawRow> = table
        .rows
        .iter()
        .map(|cells| {
            let mut row = RawRow::new();
            for (idx, header) in table.headers.iter().enumerate() {
                row.push(header.clone(), cells.get(idx).cloned().unwrap_or_default());
            }
            row
        })
        .collect();

    tracing::info!(
        "Extracted {} rows with columns {:?}",
        rows.len(),
        table.headers
    );
    Ok(rows)
}

fn parse_table(table: ElementRef<'_>) -> ParsedTable {
    let rows: Vec<ElementRef<'_>> = table
        .select(&ROW_SELECTOR)
        .filter(|row| owning_table(*row).map(|t| t.id()) == Some(table.id()))
        .collect();
    let grid = expand_spans(&rows);

    let header_idx = rows
        .iter()
        .position(|row| in_thead(*row))
        .or_else(|| rows.iter().position(|row| has_cell(*row, "th")));

    let headers: Vec<String> = header_idx
        .map(|idx| {
            grid[idx]
                .iter()
                .enumerate()
                .map(|(i, text)| {
                    if text.is_empty() {
                        format!("column_{}", i + 1)
                    } else {
                        text.clone()
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let data_rows: Vec<Vec<String>> = rows
        .iter()
        .zip(grid)
        .enumerate()
        .filter(|(idx, (row, _))| Some(*idx) != header_idx && has_cell(**row, "td"))
        .map(|(_, (_, line))| line)
        .collect();

    ParsedTable {
        text: visible_text(table),
        headers,
        rows: data_rows,
    }
}

/// Lays the rows out on a grid: a `rowspan` cell is repeated in the rows
/// below it and a `colspan` cell in the columns to its right.
fn expand_spans(rows: &[ElementRef<'_>]) -> Vec<Vec<String>> {
    // Per column: text still owed to following rows, and how many rows
    let mut carried: Vec<Option<(String, usize)>> = Vec::new();
    let mut grid = Vec::with_capacity(rows.len());

    for row in rows {
        let mut line: Vec<String> = Vec::new();
        let mut col = 0;

        for cell in cells(*row) {
            take_carried(&mut carried, &mut line, &mut col);
            let text = visible_text(cell);
            let rowspan = span(cell, "rowspan");
            for _ in 0..span(cell, "colspan") {
                if rowspan > 1 {
                    if carried.len() <= col {
                        carried.resize(col + 1, None);
                    }
                    carried[col] = Some((text.clone(), rowspan - 1));
                }
                line.push(text.clone());
                col += 1;
            }
        }
        take_carried(&mut carried, &mut line, &mut col);

        grid.push(line);
    }

    grid
}

/// Fills `line` from `col` onwards with cells spanning down from earlier rows.
fn take_carried(carried: &mut [Option<(String, usize)>], line: &mut Vec<String>, col: &mut usize) {
    while let Some(slot) = carried.get_mut(*col) {
        let Some((text, remaining)) = &mut *slot else {
            break;
        };
        line.push(text.clone());
        *remaining -= 1;
        if *remaining == 0 {
            *slot = None;
        }
        *col += 1;
    }
}

/// Span attribute value; missing, zero or unparseable spans count as one.
fn span(cell: ElementRef<'_>, attr: &str) -> usize {
    cell.value()
        .attr(attr)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .map(|n| n.min(MAX_SPAN))
        .unwrap_or(1)
}

/// Nearest enclosing `<table>`, so rows of nested tables are not mixed in.
fn owning_table(row: ElementRef<'_>) -> Option<ElementRef<'_>> {
    row.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "table")
}

fn in_thead(row: ElementRef<'_>) -> bool {
    row.ancestors()
        .filter_map(ElementRef::wrap)
        .take_while(|el| el.value().name() != "table")
        .any(|el| el.value().name() == "thead")
}

fn cells<'a>(row: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| matches!(el.value().name(), "th" | "td"))
}

fn has_cell(row: ElementRef<'_>, name: &str) -> bool {
    cells(row).any(|el| el.value().name() == name)
}

/// Text as rendered: hidden elements skipped, `<br>` as a space, whitespace collapsed.
fn visible_text(element: ElementRef<'_>) -> String {
    let mut buffer = String::new();
    collect_text(element, &mut buffer);
    buffer.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text(element: ElementRef<'_>, buffer: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => buffer.push_str(text),
            Node::Element(el) => {
                if el.name() == "br" {
                    buffer.push(' ');
                    continue;
                }
                let hidden = el
                    .attr("style")
                    .map(|style| style.replace(' ', "").contains("display:none"))
                    .unwrap_or(false);
                if hidden {
                    continue;
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    // Keep adjacent cells' text apart
                    if matches!(el.name(), "td" | "th" | "tr" | "caption") {
                        buffer.push(' ');
                    }
                    collect_text(child_el, buffer);
                }
            }
            _ => {}
        }
    }
}
