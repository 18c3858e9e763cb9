//! Structure synthesis: classified blocks → tables and Markdown.
//!
//! Table recovery is deliberately conservative. Cells on the same page whose
//! boxes lie within the adjacency threshold are joined into one table
//! (connected components, order-independent). Inside a table, rows come from
//! vertical centers and columns from the widest row; anything that does not fit
//! the grid is kept as `unassigned` text under the table. Every detected
//! fragment ends up either in the grid, under a table, or in the body text.

use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use crate::aggregate::collect_warnings;
use crate::ocr::adapter::PageOutcome;
use crate::pages::PageInfo;
use crate::schema::{BBox, BlockType, Rect, StructureBlock, StructureResult, Table};

/// Bullet glyphs that mark an unlabeled line as a list item.
static RE_BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[•·▪‣◦●○■□➢►]\s*|[-*]\s+)\S").unwrap());

/// Captures: 1 = item number (ordered lists), 2 = item text.
static RE_LIST_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[•·▪‣◦●○■□➢►]|[-*](?:\s|$)|(\d{1,3})[.)])\s*(.*)$").unwrap()
});

/// Unlabeled lines shorter than this may be headings.
const HEADING_MAX_CHARS: usize = 50;

/// A heading this many times taller than the median block is a top-level one.
const H1_HEIGHT_RATIO: f32 = 1.5;

pub struct StructureSynthesizer {
    adjacency_px: f32,
}

/// A block plus the geometry the synthesizer sorts and clusters by.
struct Placed {
    block: StructureBlock,
    page: usize,
    rect: Rect,
}

enum Element {
    Heading { level: usize, text: String },
    Paragraph { text: String, page: usize, last: Rect },
    List { items: Vec<String>, page: usize },
    Table(usize),
    Figure(String),
    Text(String),
    PageBreak,
}

impl StructureSynthesizer {
    pub fn new(adjacency_px: f32) -> Self {
        Self { adjacency_px }
    }

    /// Build the structure result. `outcomes[i]` belongs to `pages[i]`.
    pub fn synthesize(&self, pages: &[PageInfo], outcomes: &[PageOutcome]) -> StructureResult {
        let multi_page = pages.len() > 1;

        let mut placed: Vec<Placed> = pages
            .iter()
            .zip(outcomes)
            .flat_map(|(page, outcome)| {
                outcome.detections().iter().map(move |d| {
                    let content = clean_content(&d.text);
                    let block_type = d.kind.unwrap_or_else(|| classify(&content));
                    Placed {
                        rect: d.bbox.bounds(),
                        page: page.index,
                        block: StructureBlock {
                            block_type,
                            content,
                            bbox: d.bbox.clone(),
                            confidence: d.confidence,
                            page: multi_page.then_some(page.index),
                        },
                    }
                })
            })
            .collect();

        placed.sort_by(document_order);

        let components = self.cluster_cells(&placed);
        let (tables, table_of) = build_tables(&placed, &components);
        let markdown = render_markdown(&placed, &tables, &table_of, multi_page);

        debug!(
            "Synthesized {} blocks, {} tables, {} markdown chars",
            placed.len(),
            tables.len(),
            markdown.len()
        );

        StructureResult {
            blocks: placed.into_iter().map(|p| p.block).collect(),
            markdown,
            tables,
            warnings: collect_warnings(outcomes),
        }
    }

    /// Connected components of table cells, per page. Returns, for each
    /// placed block, the component id of its cluster if the cluster has at
    /// least two cells.
    fn cluster_cells(&self, placed: &[Placed]) -> Vec<Option<usize>> {
        let cells: Vec<usize> = placed
            .iter()
            .enumerate()
            .filter(|(_, p)| p.block.block_type == BlockType::TableCell)
            .map(|(i, _)| i)
            .collect();

        let mut parent: Vec<usize> = (0..cells.len()).collect();
        for a in 0..cells.len() {
            for b in (a + 1)..cells.len() {
                let (pa, pb) = (&placed[cells[a]], &placed[cells[b]]);
                if pa.page != pb.page {
                    continue;
                }
                let (dx, dy) = pa.rect.gap(&pb.rect);
                if dx <= self.adjacency_px && dy <= self.adjacency_px {
                    union(&mut parent, a, b);
                }
            }
        }

        let mut sizes: HashMap<usize, usize> = HashMap::new();
        for i in 0..cells.len() {
            *sizes.entry(find(&mut parent, i)).or_default() += 1;
        }

        let mut component = vec![None; placed.len()];
        for (i, &block) in cells.iter().enumerate() {
            let root = find(&mut parent, i);
            if sizes[&root] >= 2 {
                component[block] = Some(root);
            }
        }
        component
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let (ra, rb) = (find(parent, a), find(parent, b));
    if ra != rb {
        parent[rb] = ra;
    }
}

/// Page, then top edge, then left edge.
fn document_order(a: &Placed, b: &Placed) -> Ordering {
    a.page
        .cmp(&b.page)
        .then(a.rect.y0.total_cmp(&b.rect.y0))
        .then(a.rect.x0.total_cmp(&b.rect.x0))
}

/// Tables in document order (by their first cell), plus a map from placed
/// index to table index.
fn build_tables(placed: &[Placed], components: &[Option<usize>]) -> (Vec<Table>, Vec<Option<usize>>) {
    let mut table_of = vec![None; placed.len()];
    let mut index_of_component: HashMap<usize, usize> = HashMap::new();
    let mut members: Vec<Vec<usize>> = Vec::new();

    for (i, component) in components.iter().enumerate() {
        if let Some(c) = component {
            let t = *index_of_component.entry(*c).or_insert_with(|| {
                members.push(Vec::new());
                members.len() - 1
            });
            members[t].push(i);
            table_of[i] = Some(t);
        }
    }

    let tables = members
        .iter()
        .map(|cells| {
            let bounds = cells
                .iter()
                .map(|&i| placed[i].rect)
                .reduce(|a, b| a.union(&b))
                .unwrap_or(Rect { x0: 0.0, y0: 0.0, x1: 0.0, y1: 0.0 });
            let grid_input: Vec<(&str, Rect)> = cells
                .iter()
                .map(|&i| (placed[i].block.content.as_str(), placed[i].rect))
                .collect();
            let (rows, unassigned) = build_grid(&grid_input);
            Table {
                page: placed[cells[0]].page,
                bbox: BBox::rect(bounds),
                rows,
                unassigned,
            }
        })
        .collect();

    (tables, table_of)
}

/// Infer rows and columns for one table's cells.
///
/// Cells whose vertical centers are within one row height (median cell
/// height) of the row's first cell share a row. Column bands are taken from
/// the row with the most cells; other cells go to the band they overlap most,
/// or the nearest band within one band width. Collisions and misses are
/// returned as unassigned text.
pub fn build_grid(cells: &[(&str, Rect)]) -> (Vec<Vec<String>>, Vec<String>) {
    if cells.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut order: Vec<usize> = (0..cells.len()).collect();
    order.sort_by(|&a, &b| {
        cells[a]
            .1
            .center_y()
            .total_cmp(&cells[b].1.center_y())
            .then(cells[a].1.x0.total_cmp(&cells[b].1.x0))
    });

    let row_height = median(cells.iter().map(|(_, r)| r.height()).collect()).max(1.0);

    let mut rows: Vec<Vec<usize>> = Vec::new();
    for &i in &order {
        let cy = cells[i].1.center_y();
        match rows.last_mut() {
            Some(row) if (cy - cells[row[0]].1.center_y()).abs() < row_height => row.push(i),
            _ => rows.push(vec![i]),
        }
    }
    for row in &mut rows {
        row.sort_by(|&a, &b| cells[a].1.x0.total_cmp(&cells[b].1.x0));
    }

    let reference = rows
        .iter()
        .enumerate()
        .fold(0, |best, (r, row)| if row.len() > rows[best].len() { r } else { best });
    let bands: Vec<Rect> = rows[reference].iter().map(|&i| cells[i].1).collect();

    let mut grid: Vec<Vec<Option<usize>>> = vec![vec![None; bands.len()]; rows.len()];
    let mut unassigned: Vec<usize> = Vec::new();

    for (r, row) in rows.iter().enumerate() {
        for &i in row {
            let target = if r == reference {
                bands.iter().position(|b| *b == cells[i].1)
            } else {
                best_band(&cells[i].1, &bands)
            };
            match target {
                Some(c) if grid[r][c].is_none() => grid[r][c] = Some(i),
                _ => unassigned.push(i),
            }
        }
    }

    let rows = grid
        .into_iter()
        .filter(|row| row.iter().any(Option::is_some))
        .map(|row| {
            row.into_iter()
                .map(|cell| cell.map(|i| cells[i].0.to_string()).unwrap_or_default())
                .collect()
        })
        .collect();

    unassigned.sort_by(|&a, &b| {
        cells[a]
            .1
            .y0
            .total_cmp(&cells[b].1.y0)
            .then(cells[a].1.x0.total_cmp(&cells[b].1.x0))
    });
    let unassigned = unassigned.into_iter().map(|i| cells[i].0.to_string()).collect();

    (rows, unassigned)
}

fn best_band(rect: &Rect, bands: &[Rect]) -> Option<usize> {
    let overlapping = bands
        .iter()
        .enumerate()
        .map(|(c, band)| (c, band.horizontal_overlap(rect)))
        .filter(|(_, overlap)| *overlap > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1));
    if let Some((c, _)) = overlapping {
        return Some(c);
    }

    bands
        .iter()
        .enumerate()
        .map(|(c, band)| (c, band, (band.center_x() - rect.center_x()).abs()))
        .filter(|(_, band, distance)| *distance <= band.width())
        .min_by(|a, b| a.2.total_cmp(&b.2))
        .map(|(c, _, _)| c)
}

fn median(mut values: Vec<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn clean_content(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fallback classification for blocks the engine did not label.
pub fn classify(text: &str) -> BlockType {
    if RE_BULLET.is_match(text) {
        return BlockType::List;
    }
    let short = text.chars().count() < HEADING_MAX_CHARS;
    let digit_led = text.chars().next().is_some_and(|c| c.is_ascii_digit());
    if short && (is_upper(text) || digit_led) {
        return BlockType::Heading;
    }
    BlockType::Paragraph
}

/// At least one cased character and no lowercase ones.
fn is_upper(text: &str) -> bool {
    let mut cased = text.chars().filter(|c| c.is_uppercase() || c.is_lowercase()).peekable();
    cased.peek().is_some() && cased.all(|c| c.is_uppercase())
}

fn render_markdown(
    placed: &[Placed],
    tables: &[Table],
    table_of: &[Option<usize>],
    multi_page: bool,
) -> String {
    let median_height = median(placed.iter().map(|p| p.rect.height()).collect());
    let mut elements: Vec<Element> = Vec::new();
    let mut emitted_tables = vec![false; tables.len()];
    let mut current_page: Option<usize> = None;

    for (i, p) in placed.iter().enumerate() {
        if multi_page && current_page.is_some_and(|page| page != p.page) && !elements.is_empty() {
            elements.push(Element::PageBreak);
        }
        current_page = Some(p.page);

        if let Some(t) = table_of[i] {
            if !emitted_tables[t] {
                emitted_tables[t] = true;
                elements.push(Element::Table(t));
            }
            continue;
        }

        let content = p.block.content.clone();
        match p.block.block_type {
            BlockType::Heading => {
                let level = if median_height > 0.0 && p.rect.height() >= median_height * H1_HEIGHT_RATIO {
                    1
                } else {
                    2
                };
                elements.push(Element::Heading { level, text: content });
            }
            BlockType::Paragraph => {
                if let Some(Element::Paragraph { text, page, last }) = elements.last_mut() {
                    if continues_paragraph(*page, last, p) {
                        text.push(' ');
                        text.push_str(&content);
                        *last = p.rect;
                        continue;
                    }
                }
                elements.push(Element::Paragraph {
                    text: content,
                    page: p.page,
                    last: p.rect,
                });
            }
            BlockType::List => {
                let item = render_list_item(&content);
                if let Some(Element::List { items, page }) = elements.last_mut() {
                    if *page == p.page {
                        items.push(item);
                        continue;
                    }
                }
                elements.push(Element::List {
                    items: vec![item],
                    page: p.page,
                });
            }
            BlockType::Figure => elements.push(Element::Figure(content)),
            // A lone table cell and unclassified text render as plain text.
            BlockType::TableCell | BlockType::Other => elements.push(Element::Text(content)),
        }
    }

    elements
        .iter()
        .map(|element| match element {
            Element::Heading { level, text } => format!("{} {}", "#".repeat(*level), text),
            Element::Paragraph { text, .. } => text.clone(),
            Element::List { items, .. } => items.join("\n"),
            Element::Table(t) => render_table(&tables[*t]),
            Element::Figure(text) => format!("*{}*", text),
            Element::Text(text) => text.clone(),
            Element::PageBreak => "---".to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The next line continues a paragraph when it starts below the previous
/// line, in the same column, less than one line height further down.
fn continues_paragraph(page: usize, last: &Rect, next: &Placed) -> bool {
    if page != next.page || next.rect.y0 < last.y0 {
        return false;
    }
    let gap = next.rect.y0 - last.y1;
    gap < last.height() && last.horizontal_overlap(&next.rect) > 0.0
}

fn render_list_item(content: &str) -> String {
    if let Some(caps) = RE_LIST_MARKER.captures(content) {
        let rest = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
        if !rest.is_empty() {
            return match caps.get(1) {
                Some(number) => format!("{}. {}", number.as_str(), rest),
                None => format!("- {}", rest),
            };
        }
    }
    format!("- {}", content)
}

/// Pipe table with the first row as header, followed by unplaced cell text.
pub fn render_table(table: &Table) -> String {
    let columns = table.rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut lines = Vec::with_capacity(table.rows.len() + 1);

    for (r, row) in table.rows.iter().enumerate() {
        let cells: Vec<String> = (0..columns)
            .map(|c| escape_cell(row.get(c).map(String::as_str).unwrap_or("")))
            .collect();
        lines.push(format!("| {} |", cells.join(" | ")));
        if r == 0 {
            lines.push(format!("|{}", " --- |".repeat(columns)));
        }
    }

    let mut out = lines.join("\n");
    for loose in &table.unassigned {
        out.push_str("\n\n");
        out.push_str(loose);
    }
    out
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}
