use std::collections::HashSet;

use crate::replication::ReplicationMessage;
use crate::types::ZoneView;

pub fn sanitize_observer_name(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "Observer".to_string();
    }
    trimmed.chars().take(16).collect()
}

pub fn parse_zone_filter(raw: Option<&str>) -> Option<HashSet<String>> {
    let zones: HashSet<String> = raw?
        .split(',')
        .map(str::trim)
        .filter(|zone| !zone.is_empty())
        .map(str::to_string)
        .collect();
    if zones.is_empty() {
        None
    } else {
        Some(zones)
    }
}

pub fn zone_filter_from_list(zones: Option<Vec<String>>) -> Option<HashSet<String>> {
    let zones: HashSet<String> = zones?
        .into_iter()
        .map(|zone| zone.trim().to_string())
        .filter(|zone| !zone.is_empty())
        .collect();
    if zones.is_empty() {
        None
    } else {
        Some(zones)
    }
}

pub fn zone_matches(filter: Option<&HashSet<String>>, zone: &str) -> bool {
    filter.map(|zones| zones.contains(zone)).unwrap_or(true)
}

pub fn message_zone(message: &ReplicationMessage) -> &str {
    match message {
        ReplicationMessage::Transition { event } => &event.zone,
        ReplicationMessage::ZoneSync { zone } => &zone.zone,
    }
}

pub fn filter_views(views: Vec<ZoneView>, filter: Option<&HashSet<String>>) -> Vec<ZoneView> {
    views
        .into_iter()
        .filter(|view| zone_matches(filter, &view.zone))
        .collect()
}

pub fn resync_views(
    views: Vec<ZoneView>,
    zone: Option<&str>,
    filter: Option<&HashSet<String>>,
) -> Result<Vec<ZoneView>, &'static str> {
    let Some(zone) = zone else {
        return Ok(filter_views(views, filter));
    };
    if !zone_matches(filter, zone) {
        return Err("zone not subscribed");
    }
    let matched: Vec<ZoneView> = views.into_iter().filter(|view| view.zone == zone).collect();
    if matched.is_empty() {
        return Err("unknown zone");
    }
    Ok(matched)
}
