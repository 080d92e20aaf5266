use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::driver::{Element, Page};
use crate::error::Result;
use crate::tree::{FlatItem, build_tree};
use crate::types::{FormField, FormFields, PageState, SidebarNode, UiState};

// Selectors of the target application's UI framework.
const TREE_ITEM: &str = ".cl-tree-item";
const TREE_LABEL: &str = ".cl-text";
const DIALOG: &str = ".cl-dialog";
const DIALOG_TITLE: &str = ".cl-dialog-header .cl-text";
const TAB_PANEL: &str = "[role=\"tabpanel\"]";
const HEADING: &str = "h1, h2, h3, [role=heading]";
const FORM_CONTROLS: &str = "input, select, textarea";

pub const TITLE_NOT_RECOGNIZED: &str = "title not recognized";
pub const NO_TAB_PANEL: &str = "no tab panel";
pub const NO_ACTIVE_PANEL: &str = "no active panel";

/// Words that show up in page titles of the target application
/// (inquiry, registration, management, application, confirmation, view, print, issue).
pub const DEFAULT_TITLE_KEYWORDS: [&str; 8] =
    ["조회", "등록", "관리", "신청", "확인", "열람", "출력", "발급"];

static LEVEL_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cl-level-(\d+)").expect("static regex"));

/// Reads the visible UI of the target application.
#[derive(Debug, Clone)]
pub struct PageScanner {
    title_keywords: Vec<String>,
}

impl Default for PageScanner {
    fn default() -> Self {
        Self::new(DEFAULT_TITLE_KEYWORDS.iter().map(|k| k.to_string()).collect())
    }
}

impl PageScanner {
    pub fn new(title_keywords: Vec<String>) -> Self {
        Self { title_keywords }
    }

    /// Sidebar tree. Items that fail to parse are skipped.
    pub async fn scan_sidebar(&self, page: &dyn Page) -> Result<Vec<SidebarNode>> {
        let elements = page.locate_all(TREE_ITEM).await?;
        let mut items = Vec::with_capacity(elements.len());
        for (idx, el) in elements.iter().enumerate() {
            match read_tree_item(el.as_ref()).await {
                Ok(item) => items.push(item),
                Err(e) => warn!(index = idx, "sidebar item parse failed: {}", e),
            }
        }
        Ok(build_tree(items))
    }

    /// Title and form fields of the visible surface, or an error if the page
    /// could not be read at all. Verification uses this variant.
    pub async fn try_scan_current_page(&self, page: &dyn Page) -> Result<PageState> {
        let dialogs = page.locate_all(DIALOG).await?;
        if let Some(dialog) = first_visible(dialogs).await? {
            let title = match dialog.locate_all(DIALOG_TITLE).await?.first() {
                Some(header) => header.inner_text().await?.trim().to_string(),
                None => TITLE_NOT_RECOGNIZED.to_string(),
            };
            info!(title = %title, "modal dialog detected");
            return Ok(PageState::titled(title));
        }

        let panels = page.locate_all(TAB_PANEL).await?;
        if panels.is_empty() {
            return Ok(PageState::titled(NO_TAB_PANEL));
        }
        let Some(panel) = first_visible(panels).await? else {
            return Ok(PageState::titled(NO_ACTIVE_PANEL));
        };

        let title = match self.panel_title(panel.as_ref()).await {
            Ok(title) => title,
            Err(e) => {
                warn!("panel title extraction failed: {}", e);
                TITLE_NOT_RECOGNIZED.to_string()
            }
        };

        let fields = scan_form_fields(page).await?;
        debug!(title = %title, fields = fields.len(), "current page scanned");

        Ok(PageState {
            title,
            detail_page: String::new(),
            form_fields: FormFields::from_scan(fields),
        })
    }

    /// Like [`try_scan_current_page`](Self::try_scan_current_page) but never fails:
    /// errors are folded into the title.
    pub async fn scan_current_page(&self, page: &dyn Page) -> PageState {
        match self.try_scan_current_page(page).await {
            Ok(state) => state,
            Err(e) => {
                warn!("current page scan failed: {}", e);
                PageState {
                    title: format!("tab panel detection error: {e}"),
                    detail_page: String::new(),
                    form_fields: FormFields::NoneRecognized,
                }
            }
        }
    }

    /// Full UI snapshot. The sidebar and the current page degrade independently.
    pub async fn scan_ui_state(&self, page: &dyn Page) -> UiState {
        let url = page.url().await.unwrap_or_default();

        let sidebar = match self.scan_sidebar(page).await {
            Ok(sidebar) => sidebar,
            Err(e) => {
                warn!("sidebar scan failed: {}", e);
                Vec::new()
            }
        };

        UiState {
            url,
            sidebar,
            current_page: self.scan_current_page(page).await,
        }
    }

    async fn panel_title(&self, panel: &dyn Element) -> Result<String> {
        if let Some(heading) = panel.locate_all(HEADING).await?.first() {
            return Ok(heading.inner_text().await?.trim().to_string());
        }

        let text = panel.inner_text().await?;
        let first_line = text.trim().lines().next().unwrap_or_default().trim().to_string();
        if self.title_keywords.iter().any(|k| first_line.contains(k.as_str())) {
            info!(title = %first_line, "title taken from first line of panel");
            Ok(first_line)
        } else {
            Ok(TITLE_NOT_RECOGNIZED.to_string())
        }
    }
}

async fn read_tree_item(el: &dyn Element) -> Result<FlatItem> {
    let label = match el.locate_all(TREE_LABEL).await?.first() {
        Some(label_el) => label_el.inner_text().await?,
        None => el.inner_text().await?,
    };

    let class = el.attribute("class").await?.unwrap_or_default();
    let level_attr = el.attribute("aria-level").await?.unwrap_or_default();
    let aria_selected = el.attribute("aria-selected").await?;

    Ok(FlatItem {
        label: label.trim().to_string(),
        level: parse_level(&level_attr, &class),
        expanded: class.contains("cl-expanded"),
        checked: class.contains("cl-selected") || aria_selected.as_deref() == Some("true"),
    })
}

/// Nesting level: explicit `aria-level`, else the `cl-level-N` class token, else 1.
pub fn parse_level(level_attr: &str, class: &str) -> u32 {
    if !level_attr.is_empty() && level_attr.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(level) = level_attr.parse() {
            return level;
        }
    }
    LEVEL_CLASS
        .captures(class)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(1)
}

async fn first_visible(elements: Vec<Box<dyn Element>>) -> Result<Option<Box<dyn Element>>> {
    for el in elements {
        if el.is_visible().await? {
            return Ok(Some(el));
        }
    }
    Ok(None)
}

async fn scan_form_fields(page: &dyn Page) -> Result<Vec<FormField>> {
    let controls = page.locate_all(FORM_CONTROLS).await?;
    let mut fields = Vec::new();
    for el in &controls {
        match read_form_field(el.as_ref(), fields.len()).await {
            Ok(field) => fields.push(field),
            Err(e) => debug!("skipping unreadable form control: {}", e),
        }
    }
    Ok(fields)
}

async fn read_form_field(el: &dyn Element, position: usize) -> Result<FormField> {
    let tag = el.property("tagName").await?.unwrap_or_default().to_lowercase();
    let input_type = el
        .property("type")
        .await?
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "text".to_string());

    let mut label = el.label_text().await?.filter(|l| !l.is_empty());
    if label.is_none() {
        label = el.attribute("aria-label").await?.filter(|l| !l.is_empty());
    }
    if label.is_none() {
        label = el.attribute("placeholder").await?.filter(|l| !l.is_empty());
    }

    let value = el.property("value").await?.unwrap_or_default();

    let id = match el.attribute("id").await?.filter(|v| !v.is_empty()) {
        Some(id) => id,
        None => match el.attribute("name").await?.filter(|v| !v.is_empty()) {
            Some(name) => name,
            None => format!("{tag}_{position}"),
        },
    };

    Ok(FormField {
        id,
        label: label.unwrap_or_default().trim().to_string(),
        kind: tag,
        input_type,
        value: value.trim().to_string(),
    })
}
