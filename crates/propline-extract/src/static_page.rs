//! [`PageDriver`] over captured HTML.
//!
//! The document is parsed with `scraper` on every call and handles are the
//! element's position in document order. A small amount of page behaviour is
//! simulated from markup conventions:
//!
//! * `aria-controls="id"` on a clicked element (or an ancestor) toggles the
//!   popup with that id; Escape closes all popups.
//! * `data-category="Label"` on a clicked element (or an ancestor), or on a
//!   selected `<option>`, switches the active category. Only elements inside
//!   the matching `data-category-panel="Label"` are in the document; before
//!   any switch, panels without `hidden` are.
//! * `data-refresh-delay="N"` on `<body>` delays a switch by N page queries,
//!   during which `[data-loading-indicator]` elements are present.
//! * A container with `data-virtual-window="N"` renders only N of its
//!   `[role=row]` data rows, chosen by its own scroll offset when it declares
//!   a scrollable overflow and by the page scroll offset otherwise.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};

use crate::driver::{
    DriverError, ElementHandle, Key, PageDriver, ScrollMetrics, TableSelectors, TableSnapshot,
};

/// Rendered height of one virtualized row.
pub const ROW_HEIGHT_PX: f64 = 40.0;
const DEFAULT_VIEWPORT_PX: f64 = 800.0;
const DEFAULT_VIRTUAL_WINDOW: usize = 10;

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "dd", "div", "dl", "dt", "fieldset", "figure",
    "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav",
    "ol", "p", "pre", "section", "table", "tbody", "thead", "tfoot", "tr", "ul",
];

static ANY_ELEMENT: LazyLock<Selector> = LazyLock::new(|| Selector::parse("*").expect("any element"));
static GRID_ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("[role=row]").expect("grid row"));
static GRID_CELL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[role=cell], [role=gridcell], td").expect("grid cell"));
static OPTION: LazyLock<Selector> = LazyLock::new(|| Selector::parse("option").expect("option"));

#[derive(Debug, Default)]
struct PageState {
    open_popups: HashSet<usize>,
    active_category: Option<String>,
    pending_category: Option<(String, u32)>,
    scroll_tops: Vec<(usize, f64)>,
    page_scroll: f64,
    escape_presses: usize,
    clicked: Vec<String>,
}

impl PageState {
    fn scroll_top(&self, index: usize) -> f64 {
        self.scroll_tops
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, top)| *top)
            .unwrap_or(0.0)
    }

    fn set_scroll_top(&mut self, index: usize, top: f64) {
        match self.scroll_tops.iter_mut().find(|(i, _)| *i == index) {
            Some(entry) => entry.1 = top,
            None => self.scroll_tops.push((index, top)),
        }
    }

    fn switch_category(&mut self, category: String, delay: u32) {
        self.open_popups.clear();
        if self.pending_category.is_none() && self.active_category.as_deref() == Some(category.as_str()) {
            return;
        }
        if delay == 0 {
            self.active_category = Some(category);
            self.pending_category = None;
        } else {
            self.pending_category = Some((category, delay));
        }
    }

    fn tick(&mut self) {
        if let Some((category, remaining)) = self.pending_category.take() {
            if remaining <= 1 {
                self.active_category = Some(category);
            } else {
                self.pending_category = Some((category, remaining - 1));
            }
        }
    }
}

#[derive(Debug)]
pub struct StaticDomPage {
    html: String,
    refresh_delay: u32,
    viewport_height: f64,
    state: Mutex<PageState>,
}

impl StaticDomPage {
    pub fn from_html(html: impl Into<String>) -> Self {
        let html = html.into();
        let (refresh_delay, viewport_height) = {
            let doc = Html::parse_document(&html);
            let body = Selector::parse("body")
                .ok()
                .and_then(|sel| doc.select(&sel).next());
            let attr = |name: &str| body.and_then(|b| b.value().attr(name)).map(str::trim).map(str::to_string);
            (
                attr("data-refresh-delay")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                attr("data-viewport-height")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_VIEWPORT_PX),
            )
        };
        Self {
            html,
            refresh_delay,
            viewport_height,
            state: Mutex::new(PageState::default()),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let html = fs::read_to_string(path)
            .with_context(|| format!("reading page fixture {}", path.display()))?;
        Ok(Self::from_html(html))
    }

    /// Category whose panel is currently shown, once one has been chosen.
    pub fn active_category(&self) -> Option<String> {
        self.state().active_category.clone()
    }

    pub fn escape_presses(&self) -> usize {
        self.state().escape_presses
    }

    /// Text of every element clicked so far, in order.
    pub fn clicked(&self) -> Vec<String> {
        self.state().clicked.clone()
    }

    fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_view<R>(&self, tick: bool, f: impl FnOnce(&View<'_>) -> R) -> R {
        let doc = Html::parse_document(&self.html);
        let mut state = self.state();
        if tick {
            state.tick();
        }
        let view = View::new(&doc, &state);
        f(&view)
    }

    fn query_all_sync(&self, css: &str) -> Result<Vec<ElementHandle>, DriverError> {
        let sel = selector(css)?;
        self.with_view(true, |view| {
            Ok(view
                .doc
                .select(&sel)
                .filter(|el| view.is_attached(*el))
                .map(|el| view.handle(el))
                .collect())
        })
    }

    fn query_within_sync(
        &self,
        scope: &ElementHandle,
        css: &str,
    ) -> Result<Vec<ElementHandle>, DriverError> {
        let sel = selector(css)?;
        self.with_view(false, |view| {
            let scope = view.element(scope)?;
            Ok(scope
                .select(&sel)
                .filter(|el| view.is_attached(*el))
                .map(|el| view.handle(el))
                .collect())
        })
    }

    fn click_sync(&self, handle: &ElementHandle) -> Result<(), DriverError> {
        let doc = Html::parse_document(&self.html);
        let mut state = self.state();
        let (action, text) = {
            let view = View::new(&doc, &state);
            let el = view.element(handle)?;
            if !view.is_visible(el) {
                return Err(DriverError::NotInteractable(handle.id().to_string()));
            }
            (view.click_action(el), view.text(el))
        };
        state.clicked.push(text.lines().next().unwrap_or_default().to_string());
        match action {
            ClickAction::Category(category) => state.switch_category(category, self.refresh_delay),
            ClickAction::TogglePopup(index) => {
                if !state.open_popups.remove(&index) {
                    state.open_popups.insert(index);
                }
            }
            ClickAction::Nothing => {}
        }
        Ok(())
    }

    fn select_option_sync(&self, select: &ElementHandle, label: &str) -> Result<bool, DriverError> {
        let doc = Html::parse_document(&self.html);
        let mut state = self.state();
        let category = {
            let view = View::new(&doc, &state);
            let select = view.element(select)?;
            select
                .select(&OPTION)
                .find(|opt| view.text(*opt).eq_ignore_ascii_case(label.trim()))
                .map(|opt| {
                    opt.value()
                        .attr("data-category")
                        .map(str::to_string)
                        .unwrap_or_else(|| view.text(opt))
                })
        };
        match category {
            Some(category) => {
                state.switch_category(category, self.refresh_delay);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn read_table_sync(&self, selectors: &TableSelectors) -> Result<TableSnapshot, DriverError> {
        let table_sel = selector(&selectors.table)?;
        let header_sel = selector(&selectors.header_cells)?;
        let row_sel = selector(&selectors.body_rows)?;
        let cell_sel = selector(&selectors.cells)?;
        self.with_view(true, |view| {
            let Some(table) = view.doc.select(&table_sel).find(|el| view.is_attached(*el)) else {
                return Ok(TableSnapshot::default());
            };
            let headers = table
                .select(&header_sel)
                .filter(|el| view.is_attached(*el))
                .map(|el| view.text(el))
                .collect();
            let rows = table
                .select(&row_sel)
                .filter(|row| view.is_attached(*row))
                .map(|row| {
                    row.select(&cell_sel)
                        .filter(|el| view.is_attached(*el))
                        .map(|el| view.text(el))
                        .collect::<Vec<_>>()
                })
                .filter(|cells| !cells.is_empty())
                .collect();
            Ok(TableSnapshot { headers, rows })
        })
    }

    fn scroll_metrics_sync(&self, handle: &ElementHandle) -> Result<ScrollMetrics, DriverError> {
        self.with_view(false, |view| {
            let el = view.element(handle)?;
            Ok(view.scroll_metrics(el))
        })
    }

    fn scroll_to_sync(&self, handle: &ElementHandle, top: f64) -> Result<(), DriverError> {
        let doc = Html::parse_document(&self.html);
        let mut state = self.state();
        let (index, max) = {
            let view = View::new(&doc, &state);
            let el = view.element(handle)?;
            (view.index_of(el), view.scroll_metrics(el).max_scroll_top())
        };
        state.set_scroll_top(index, top.clamp(0.0, max));
        Ok(())
    }
}

#[async_trait]
impl PageDriver for StaticDomPage {
    async fn query_all(&self, selector: &str) -> Result<Vec<ElementHandle>, DriverError> {
        self.query_all_sync(selector)
    }

    async fn query_within(
        &self,
        scope: &ElementHandle,
        selector: &str,
    ) -> Result<Vec<ElementHandle>, DriverError> {
        self.query_within_sync(scope, selector)
    }

    async fn parent(&self, element: &ElementHandle) -> Result<Option<ElementHandle>, DriverError> {
        self.with_view(false, |view| {
            let el = view.element(element)?;
            Ok(el
                .parent()
                .and_then(ElementRef::wrap)
                .map(|parent| view.handle(parent)))
        })
    }

    async fn inner_text(&self, element: &ElementHandle) -> Result<String, DriverError> {
        self.with_view(false, |view| Ok(view.text(view.element(element)?)))
    }

    async fn attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        self.with_view(false, |view| {
            Ok(view.element(element)?.value().attr(name).map(str::to_string))
        })
    }

    async fn is_visible(&self, element: &ElementHandle) -> Result<bool, DriverError> {
        self.with_view(false, |view| Ok(view.is_visible(view.element(element)?)))
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError> {
        self.click_sync(element)
    }

    async fn press_key(&self, key: Key) -> Result<(), DriverError> {
        if key == Key::Escape {
            let mut state = self.state();
            state.open_popups.clear();
            state.escape_presses += 1;
        }
        Ok(())
    }

    async fn select_option(&self, select: &ElementHandle, label: &str) -> Result<bool, DriverError> {
        self.select_option_sync(select, label)
    }

    async fn read_table(&self, selectors: &TableSelectors) -> Result<TableSnapshot, DriverError> {
        self.read_table_sync(selectors)
    }

    async fn scroll_metrics(&self, element: &ElementHandle) -> Result<ScrollMetrics, DriverError> {
        self.scroll_metrics_sync(element)
    }

    async fn scroll_to(&self, element: &ElementHandle, top: f64) -> Result<(), DriverError> {
        self.scroll_to_sync(element, top)
    }

    async fn wheel(&self, delta_y: f64) -> Result<(), DriverError> {
        let mut state = self.state();
        state.page_scroll = (state.page_scroll + delta_y).max(0.0);
        Ok(())
    }

    async fn scroll_page_to_top(&self) -> Result<(), DriverError> {
        self.state().page_scroll = 0.0;
        Ok(())
    }

    async fn viewport_height(&self) -> Result<f64, DriverError> {
        Ok(self.viewport_height)
    }

    async fn wait_for_network_idle(&self, _timeout: Duration) -> Result<bool, DriverError> {
        Ok(true)
    }
}

fn selector(css: &str) -> Result<Selector, DriverError> {
    Selector::parse(css).map_err(|err| DriverError::Selector {
        selector: css.to_string(),
        message: format!("{err:?}"),
    })
}

fn style_value(el: ElementRef<'_>, property: &str) -> Option<String> {
    el.value().attr("style")?.split(';').find_map(|decl| {
        let (name, value) = decl.split_once(':')?;
        (name.trim().eq_ignore_ascii_case(property)).then(|| value.trim().to_ascii_lowercase())
    })
}

fn overflow_y(el: ElementRef<'_>) -> String {
    style_value(el, "overflow-y")
        .or_else(|| style_value(el, "overflow"))
        .unwrap_or_else(|| "visible".to_string())
}

fn declares_scroll(el: ElementRef<'_>) -> bool {
    matches!(overflow_y(el).as_str(), "auto" | "scroll" | "overlay")
}

fn self_and_ancestors(el: ElementRef<'_>) -> impl Iterator<Item = ElementRef<'_>> {
    std::iter::once(el).chain(el.ancestors().filter_map(ElementRef::wrap))
}

enum ClickAction {
    Category(String),
    TogglePopup(usize),
    Nothing,
}

/// One parsed document plus the simulated state, for a single driver call.
struct View<'a> {
    doc: &'a Html,
    state: &'a PageState,
    elements: Vec<ElementRef<'a>>,
}

impl<'a> View<'a> {
    fn new(doc: &'a Html, state: &'a PageState) -> Self {
        Self {
            doc,
            state,
            elements: doc.select(&ANY_ELEMENT).collect(),
        }
    }

    fn index_of(&self, el: ElementRef<'a>) -> usize {
        self.elements
            .iter()
            .position(|candidate| *candidate == el)
            .unwrap_or(usize::MAX)
    }

    fn handle(&self, el: ElementRef<'a>) -> ElementHandle {
        ElementHandle::new(self.index_of(el).to_string())
    }

    /// Resolves a handle, failing when the element left the document.
    fn element(&self, handle: &ElementHandle) -> Result<ElementRef<'a>, DriverError> {
        let detached = || DriverError::Detached(handle.id().to_string());
        let index: usize = handle.id().parse().map_err(|_| detached())?;
        let el = self.elements.get(index).copied().ok_or_else(detached)?;
        if self.is_attached(el) {
            Ok(el)
        } else {
            Err(detached())
        }
    }

    fn is_attached(&self, el: ElementRef<'a>) -> bool {
        self_and_ancestors(el).all(|a| self.own_attached(a))
    }

    fn is_visible(&self, el: ElementRef<'a>) -> bool {
        self_and_ancestors(el).all(|a| self.own_attached(a) && self.own_shown(a))
    }

    fn own_attached(&self, el: ElementRef<'a>) -> bool {
        let attrs = el.value();
        if let Some(panel) = attrs.attr("data-category-panel") {
            let shown = match &self.state.active_category {
                Some(active) => active == panel,
                None => attrs.attr("hidden").is_none(),
            };
            if !shown {
                return false;
            }
        }
        if attrs.attr("data-loading-indicator").is_some() && self.state.pending_category.is_none() {
            return false;
        }
        if attrs.attr("role") == Some("row") {
            if let Some(container) = self.virtual_container(el) {
                let rows = self.virtual_rows(container);
                if let Some(position) = rows.iter().position(|row| *row == el) {
                    let (first, window) = self.virtual_window(container);
                    return position >= first && position < first + window;
                }
            }
        }
        true
    }

    fn own_shown(&self, el: ElementRef<'a>) -> bool {
        let attrs = el.value();
        let opened = self.state.open_popups.contains(&self.index_of(el));
        if opened {
            return true;
        }
        if attrs.attr("hidden").is_some() {
            let active_panel = attrs.attr("data-category-panel").is_some()
                && self.state.active_category.as_deref() == attrs.attr("data-category-panel");
            if !active_panel {
                return false;
            }
        }
        style_value(el, "display").as_deref() != Some("none")
    }

    fn virtual_container(&self, el: ElementRef<'a>) -> Option<ElementRef<'a>> {
        el.ancestors()
            .filter_map(ElementRef::wrap)
            .find(|a| a.value().attr("data-virtual-window").is_some())
    }

    /// Data rows of a virtualized container; header rows have no cells.
    fn virtual_rows(&self, container: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        container
            .select(&GRID_ROW)
            .filter(|row| row.select(&GRID_CELL).next().is_some())
            .collect()
    }

    fn virtual_window(&self, container: ElementRef<'a>) -> (usize, usize) {
        let window = container
            .value()
            .attr("data-virtual-window")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_VIRTUAL_WINDOW);
        let offset = if declares_scroll(container) {
            self.state.scroll_top(self.index_of(container))
        } else {
            self.state.page_scroll
        };
        ((offset / ROW_HEIGHT_PX).floor().max(0.0) as usize, window)
    }

    fn scroll_metrics(&self, el: ElementRef<'a>) -> ScrollMetrics {
        let (scroll_height, client_height) = match el.value().attr("data-virtual-window") {
            Some(_) => {
                let (_, window) = self.virtual_window(el);
                let rows = self.virtual_rows(el).len();
                (rows as f64 * ROW_HEIGHT_PX, window.min(rows) as f64 * ROW_HEIGHT_PX)
            }
            None => (0.0, 0.0),
        };
        ScrollMetrics {
            overflow_y: overflow_y(el),
            scroll_top: self.state.scroll_top(self.index_of(el)),
            scroll_height,
            client_height,
        }
    }

    fn click_action(&self, el: ElementRef<'a>) -> ClickAction {
        for a in self_and_ancestors(el) {
            if let Some(category) = a.value().attr("data-category") {
                return ClickAction::Category(category.to_string());
            }
            if let Some(target) = a.value().attr("aria-controls") {
                let popup = self
                    .elements
                    .iter()
                    .position(|candidate| candidate.value().id() == Some(target));
                return match popup {
                    Some(index) => ClickAction::TogglePopup(index),
                    None => ClickAction::Nothing,
                };
            }
        }
        ClickAction::Nothing
    }

    /// Rendered text: block elements on their own lines, whitespace collapsed,
    /// elements outside the document or hidden skipped.
    fn text(&self, el: ElementRef<'a>) -> String {
        let mut out = String::new();
        self.render(el, &mut out);
        out.lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn render(&self, el: ElementRef<'a>, out: &mut String) {
        for child in el.children() {
            match child.value() {
                Node::Text(text) => out.push_str(text),
                Node::Element(element) => {
                    let Some(child) = ElementRef::wrap(child) else {
                        continue;
                    };
                    let name = element.name();
                    if matches!(name, "script" | "style" | "template")
                        || !self.own_attached(child)
                        || !self.own_shown(child)
                    {
                        continue;
                    }
                    if name == "br" {
                        out.push('\n');
                        continue;
                    }
                    let block = BLOCK_TAGS.contains(&name);
                    if block {
                        out.push('\n');
                    }
                    self.render(child, out);
                    if block {
                        out.push('\n');
                    } else if matches!(name, "td" | "th") {
                        out.push(' ');
                    }
                }
                _ => {}
            }
        }
    }
}
