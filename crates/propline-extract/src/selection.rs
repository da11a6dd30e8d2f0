//! Re-activating a discovered category, whatever control offered it.

use std::collections::HashSet;

use propline_core::CategoryOption;
use tracing::debug;

use crate::discovery::{close_popup, first_line};
use crate::driver::{visible_texts, DriverError, ElementHandle, PageDriver};
use crate::profile::{word_normalize, ExtractionProfile};
use crate::ExtractError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedVia {
    NativeSelect,
    Popup,
    Clickable,
}

fn loose(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Makes the page show `option`'s data. Native selects first, then every
/// popup-capable control, then bare clickables.
pub async fn select_category(
    page: &dyn PageDriver,
    option: &CategoryOption,
    profile: &ExtractionProfile,
) -> Result<SelectedVia, ExtractError> {
    if select_native(page, option, profile).await? {
        return Ok(SelectedVia::NativeSelect);
    }
    if select_from_popups(page, option, profile).await? {
        return Ok(SelectedVia::Popup);
    }
    if select_clickable(page, option, profile).await? {
        return Ok(SelectedVia::Clickable);
    }
    Err(ExtractError::SelectionNotFound {
        label: option.label.clone(),
    })
}

async fn select_native(
    page: &dyn PageDriver,
    option: &CategoryOption,
    profile: &ExtractionProfile,
) -> Result<bool, DriverError> {
    let wanted = loose(&option.label);
    for select in page.query_all(&profile.select_selector).await? {
        for item in page.query_within(&select, "option").await? {
            let text = page.inner_text(&item).await?;
            if loose(&text) == wanted && page.select_option(&select, text.trim()).await? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

async fn select_from_popups(
    page: &dyn PageDriver,
    option: &CategoryOption,
    profile: &ExtractionProfile,
) -> Result<bool, DriverError> {
    let mut tried = HashSet::new();
    let selectors = profile
        .combobox_selectors
        .iter()
        .chain(profile.popup_trigger_selectors.iter());
    for selector in selectors {
        for trigger in page.query_all(selector).await? {
            if !tried.insert(trigger.clone()) || !page.is_visible(&trigger).await? {
                continue;
            }
            if let Err(err) = page.click(&trigger).await {
                debug!(element = trigger.id(), error = %err, "popup trigger click failed");
                continue;
            }
            tokio::time::sleep(profile.timing.popup_settle()).await;
            match click_matching_item(page, option, profile).await {
                Ok(true) => {
                    tokio::time::sleep(profile.timing.popup_settle()).await;
                    return Ok(true);
                }
                Ok(false) => close_popup(page, profile).await,
                Err(err) => {
                    close_popup(page, profile).await;
                    return Err(err);
                }
            }
        }
    }
    Ok(false)
}

/// Exact text, then case/whitespace-insensitive among role items, then
/// substring among list items.
async fn click_matching_item(
    page: &dyn PageDriver,
    option: &CategoryOption,
    profile: &ExtractionProfile,
) -> Result<bool, DriverError> {
    let label = option.label.as_str();
    if let Some(item) = find_item(page, &profile.list_item_selectors, |text| first_line(text) == label).await? {
        return click(page, &item).await;
    }

    let wanted = loose(label);
    if let Some(item) =
        find_item(page, &profile.role_item_selectors, |text| loose(&first_line(text)) == wanted).await?
    {
        return click(page, &item).await;
    }

    if let Some(item) = find_item(page, &profile.list_item_selectors, |text| loose(text).contains(&wanted)).await? {
        return click(page, &item).await;
    }
    Ok(false)
}

async fn find_item(
    page: &dyn PageDriver,
    selectors: &[String],
    matches: impl Fn(&str) -> bool + Send,
) -> Result<Option<ElementHandle>, DriverError> {
    for selector in selectors {
        for (item, text) in visible_texts(page, selector).await? {
            if matches(&text) {
                return Ok(Some(item));
            }
        }
    }
    Ok(None)
}

async fn click(page: &dyn PageDriver, element: &ElementHandle) -> Result<bool, DriverError> {
    match page.click(element).await {
        Ok(()) => Ok(true),
        Err(err) if err.is_detached() => Ok(false),
        Err(err) => Err(err),
    }
}

async fn select_clickable(
    page: &dyn PageDriver,
    option: &CategoryOption,
    profile: &ExtractionProfile,
) -> Result<bool, DriverError> {
    let wanted = loose(&option.label);
    let wanted_words = word_normalize(&option.label);
    let candidates = visible_texts(page, &profile.clickable_selector).await?;

    let exact = candidates
        .iter()
        .find(|(_, text)| loose(&first_line(text)) == wanted);
    let vocabulary = || {
        candidates.iter().find(|(_, text)| {
            let text = first_line(text);
            profile.matches_vocabulary(&text) && word_normalize(&text) == wanted_words
        })
    };
    match exact.or_else(vocabulary) {
        Some((element, _)) => click(page, element).await,
        None => Ok(false),
    }
}
