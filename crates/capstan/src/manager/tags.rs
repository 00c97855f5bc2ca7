//! Tag registry operations and uncertainty propagation.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use streamidx::query::{feature, Query, TagDetails};
use streamidx::{StreamId, StreamSet};

use crate::error::{config_err, not_found, ManagerError, Result};
use crate::state::TagRecord;

use super::{ManagerState, TagInfo, UpdateTagOp};

pub(crate) const TAG_PREFIXES: [&str; 4] = ["tag", "service", "mark", "generated"];

pub(crate) struct Tag {
    pub details: TagDetails,
    pub definition: String,
    pub features: streamidx::query::FeatureSet,
    pub color: String,
    /// Attached converter names, in attachment order.
    pub converters: Vec<String>,
    /// Attached filter names.
    pub filters: Vec<String>,
}

pub(crate) fn is_mark_name(name: &str) -> bool {
    name.starts_with("mark/") || name.starts_with("generated/")
}

fn valid_tag_name(name: &str) -> bool {
    match name.split_once('/') {
        Some((prefix, rest)) => TAG_PREFIXES.contains(&prefix) && !rest.is_empty(),
        None => false,
    }
}

/// Canonical `id:` definition for a mark's match set.
fn id_definition(matches: &StreamSet) -> String {
    if matches.is_empty() {
        return "id:-1".to_string();
    }
    let ids: Vec<String> = matches.iter().map(|id| id.to_string()).collect();
    format!("id:{}", ids.join(","))
}

impl ManagerState {
    pub(crate) fn add_tag(&mut self, name: &str, color: &str, definition: &str) -> Result<()> {
        if !valid_tag_name(name) {
            return config_err(
                "invalid tag name (need a 'tag/', 'service/', 'mark/' or 'generated/' prefix)",
            );
        }
        let is_mark = is_mark_name(name);
        let query = Query::parse(definition)?;
        let features = query.conditions.features();
        if (features.main | features.sub) & feature::TIME_RELATIVE != 0 {
            return config_err("relative times not supported in tags");
        }
        if query.grouping.is_some() {
            return config_err("grouping not allowed in tags");
        }
        if features.referenced_tags().any(|t| t == name) {
            return config_err("self reference not allowed in tags");
        }
        if is_mark && query.conditions.stream_ids(0).is_none() {
            return config_err("tags of type 'mark' may only contain an 'id' filter");
        }
        if self.tags.contains_key(name) {
            return config_err("tag already exists");
        }
        for referenced in features.referenced_tags() {
            if !self.tags.contains_key(referenced) {
                return config_err(format!("unknown referenced tag {referenced:?}"));
            }
        }

        let mut tag = Tag {
            details: TagDetails {
                matches: StreamSet::new(),
                uncertain: StreamSet::new(),
                conditions: query.conditions.clone(),
            },
            definition: definition.to_string(),
            features,
            color: color.to_string(),
            converters: Vec::new(),
            filters: Vec::new(),
        };
        if is_mark {
            tag.details.matches = query
                .conditions
                .stream_ids(self.next_stream_id)
                .unwrap_or_default();
        } else {
            tag.details.uncertain = self.all_streams.clone();
        }
        self.tags.insert(name.to_string(), tag);
        if !is_mark {
            self.start_tagging_if_needed();
        }
        self.save_state();
        Ok(())
    }

    pub(crate) async fn del_tag(&mut self, name: &str) -> Result<()> {
        if !self.tags.contains_key(name) {
            return not_found(format!("unknown tag {name:?}"));
        }
        for (other_name, other) in &self.tags {
            if other_name != name && other.features.referenced_tags().any(|t| t == name) {
                return config_err(format!(
                    "tag {other_name:?} still references the tag to be deleted"
                ));
            }
        }
        let converters = self.tags[name].converters.clone();
        for converter in converters {
            self.detach_converter_from_tag(name, &converter).await?;
        }
        let filters = self.tags[name].filters.clone();
        for filter in filters {
            self.detach_filter_from_tag(name, &filter)?;
        }
        self.tags.remove(name);
        self.save_state();
        Ok(())
    }

    pub(crate) async fn update_tag(&mut self, name: &str, op: UpdateTagOp) -> Result<()> {
        if !self.tags.contains_key(name) {
            return not_found(format!("unknown tag {name:?}"));
        }
        match op {
            UpdateTagOp::SetColor(color) => {
                self.tags.get_mut(name).unwrap().color = color;
            }
            UpdateTagOp::SetConverters(wanted) => {
                let current = self.tags[name].converters.clone();
                for converter in &current {
                    if !wanted.contains(converter) {
                        self.detach_converter_from_tag(name, converter)
                            .await
                            .map_err(|e| {
                                ManagerError::Config(format!(
                                    "failed to detach converter {converter:?} from tag {name:?}: {e}"
                                ))
                            })?;
                    }
                }
                for converter in &wanted {
                    if current.contains(converter) {
                        continue;
                    }
                    if !self.converters.contains_key(converter) {
                        return config_err(format!("unknown converter {converter:?}"));
                    }
                    self.attach_converter_to_tag(name, converter)?;
                }
            }
            UpdateTagOp::MarkAdd(ids) | UpdateTagOp::MarkDel(ids) if ids.is_empty() => {}
            UpdateTagOp::MarkAdd(ids) => self.update_mark(name, &ids, true)?,
            UpdateTagOp::MarkDel(ids) => self.update_mark(name, &ids, false)?,
        }
        self.save_state();
        Ok(())
    }

    fn update_mark(&mut self, name: &str, ids: &[StreamId], add: bool) -> Result<()> {
        if !is_mark_name(name) {
            return config_err(format!("tag {name:?} is not of type 'mark' or 'generated'"));
        }
        let max = ids.iter().copied().max().unwrap_or(0);
        if max >= self.next_stream_id {
            return not_found(format!("unknown stream id {max}"));
        }

        let tag = self.tags.get_mut(name).unwrap();
        let mut matches = tag.details.matches.clone();
        let mut uncertain = tag.details.uncertain.clone();
        for &id in ids {
            if add {
                matches.set(id);
            } else {
                matches.unset(id);
            }
            uncertain.set(id);
        }
        let definition = id_definition(&matches);
        let query = Query::parse(&definition).expect("canonical id definitions always parse");
        tag.details.matches = matches;
        tag.details.uncertain = uncertain;
        tag.details.conditions = query.conditions.clone();
        tag.features = query.conditions.features();
        tag.definition = definition;

        // Dependents see the modified ids; the mark itself is
        // authoritative and stays certain.
        self.inherit_tag_uncertainty();
        self.tags.get_mut(name).unwrap().details.uncertain = StreamSet::new();
        self.start_tagging_if_needed();
        Ok(())
    }

    /// Converters must never trigger recursively, so a tag can only carry
    /// converters while its query is a plain id filter without tag
    /// references.
    pub(crate) fn attach_converter_to_tag(&mut self, tag_name: &str, converter: &str) -> Result<()> {
        let tag = self.tags.get_mut(tag_name).unwrap();
        if tag.converters.iter().any(|c| c == converter) {
            return Ok(());
        }
        let features = &tag.features;
        if (features.main | features.sub) & !feature::ID != 0 || features.references_tags() {
            return config_err(format!(
                "cannot attach converter to tag {tag_name:?} because its query is too complex"
            ));
        }
        tag.converters.push(converter.to_string());
        let matches = tag.details.matches.clone();
        self.streams_to_convert
            .entry(converter.to_string())
            .or_default()
            .or(&matches);
        self.start_converter_if_needed();
        Ok(())
    }

    /// Detaches and drops cache entries for streams no other attached tag
    /// still matches; with no attached tags left the whole cache resets.
    pub(crate) async fn detach_converter_from_tag(
        &mut self,
        tag_name: &str,
        converter: &str,
    ) -> Result<()> {
        self.tags
            .get_mut(tag_name)
            .unwrap()
            .converters
            .retain(|c| c != converter);

        let mut matched_elsewhere = StreamSet::new();
        for (name, tag) in &self.tags {
            if name != tag_name && tag.converters.iter().any(|c| c == converter) {
                matched_elsewhere.or(&tag.details.matches);
            }
        }
        let mut only_this_tag = self.tags[tag_name].details.matches.clone();
        only_this_tag.subtract(&matched_elsewhere);
        if let Some(queue) = self.streams_to_convert.get_mut(converter) {
            queue.subtract(&only_this_tag);
        }

        if matched_elsewhere.is_empty() {
            if let Some(cached) = self.converters.get(converter) {
                cached.reset().await.map_err(ManagerError::from_anyhow)?;
            }
        }
        Ok(())
    }

    pub(crate) async fn attach_filter_to_tag(&mut self, tag_name: &str, filter: &str) -> Result<()> {
        if !self.tags.contains_key(tag_name) {
            return not_found(format!("unknown tag {tag_name:?}"));
        }
        if !self.filters.contains_key(filter) {
            return not_found(format!("unknown filter {filter:?}"));
        }
        let tag = self.tags.get_mut(tag_name).unwrap();
        if !tag.filters.iter().any(|f| f == filter) {
            tag.filters.push(filter.to_string());
        }
        let matches = tag.details.matches.clone();
        let f = self.filters.get_mut(filter).unwrap();
        f.attach_tag(tag_name);
        let streams: Vec<_> = matches
            .iter()
            .filter(|&id| !f.has_stream(id))
            .filter_map(|id| super::find_stream(&self.indexes, id).cloned())
            .collect();
        if let Some(f) = self.filters.get(filter) {
            for stream in streams {
                f.enqueue(stream).await;
            }
        }
        Ok(())
    }

    pub(crate) fn detach_filter_from_tag(&mut self, tag_name: &str, filter: &str) -> Result<()> {
        if let Some(tag) = self.tags.get_mut(tag_name) {
            tag.filters.retain(|f| f != filter);
        }
        if let Some(f) = self.filters.get_mut(filter) {
            f.detach_tag(tag_name);
        }
        Ok(())
    }

    pub(crate) fn list_tags(&self) -> Vec<TagInfo> {
        let mut referenced: HashSet<&str> = HashSet::new();
        for tag in self.tags.values() {
            referenced.extend(tag.features.referenced_tags());
        }
        self.tags
            .iter()
            .map(|(name, tag)| {
                let mut matching = tag.details.matches.clone();
                matching.subtract(&tag.details.uncertain);
                TagInfo {
                    name: name.clone(),
                    definition: tag.definition.clone(),
                    color: tag.color.clone(),
                    matching_count: matching.count() as u64,
                    uncertain_count: tag.details.uncertain.count() as u64,
                    referenced: referenced.contains(name.as_str()),
                    converters: tag.converters.clone(),
                }
            })
            .collect()
    }

    /// Processes tags in dependency order. A tag whose subquery references
    /// an uncertain tag is fully invalidated; otherwise it inherits the
    /// union of its main references' uncertainty.
    pub(crate) fn inherit_tag_uncertainty(&mut self) {
        let names: Vec<String> = self.tags.keys().cloned().collect();
        let mut resolved: HashSet<String> = HashSet::new();
        while resolved.len() != self.tags.len() {
            let mut progressed = false;
            'outer: for name in &names {
                if resolved.contains(name) {
                    continue;
                }
                {
                    let tag = &self.tags[name];
                    for referenced in tag.features.referenced_tags() {
                        if self.tags.contains_key(referenced) && !resolved.contains(referenced) {
                            continue 'outer;
                        }
                    }
                }
                resolved.insert(name.clone());
                progressed = true;

                let new_uncertain = {
                    let tag = &self.tags[name];
                    if !tag.features.references_tags() {
                        continue;
                    }
                    let fully_invalidated = tag.features.sub_tags.iter().any(|rt| {
                        self.tags
                            .get(rt)
                            .map(|r| !r.details.uncertain.is_empty())
                            .unwrap_or(false)
                    });
                    if fully_invalidated {
                        self.all_streams.clone()
                    } else {
                        let mut merged = tag.details.uncertain.clone();
                        for rt in &tag.features.main_tags {
                            if let Some(r) = self.tags.get(rt) {
                                merged.or(&r.details.uncertain);
                            }
                        }
                        merged
                    }
                };
                self.tags.get_mut(name).unwrap().details.uncertain = new_uncertain;
            }
            // The graph is kept acyclic, so every pass must resolve
            // something.
            if !progressed {
                warn!("tag dependency graph did not resolve, skipping inheritance");
                break;
            }
        }
    }

    /// Marks streams whose predicates may have changed after an import.
    pub(crate) fn invalidate_tags(&mut self, updated: &StreamSet, added: &StreamSet) {
        let all = self.all_streams.clone();
        for tag in self.tags.values_mut() {
            if tag.features.sub != 0 {
                tag.details.uncertain = all.clone();
            } else if tag.features.main & !feature::ID == 0 {
                continue;
            } else {
                tag.details.uncertain.or(added);
                if tag.features.main & feature::DATA_OR_TIME != 0 {
                    tag.details.uncertain.or(updated);
                }
            }
        }
        self.inherit_tag_uncertainty();
    }
}

/// Rebuilds the tag map from a state file. Returns `None` (and logs) when
/// the file is unusable as a whole; unknown converters only lose the
/// attachment. The second element lists (tag, converter) pairs to attach
/// once the manager state exists.
pub(crate) fn tags_from_state(
    records: &[TagRecord],
    all_streams: &StreamSet,
    next_stream_id: StreamId,
    source: &std::path::Path,
) -> Option<(
    std::collections::BTreeMap<String, Tag>,
    Vec<(String, String)>,
)> {
    let mut tags = std::collections::BTreeMap::new();
    let mut attachments = Vec::new();
    for record in records {
        let query = match Query::parse(&record.definition) {
            Ok(q) => q,
            Err(e) => {
                warn!(state = %source.display(), tag = %record.name, error = %e, "invalid tag definition");
                return None;
            }
        };
        if tags.contains_key(&record.name) {
            warn!(state = %source.display(), tag = %record.name, "duplicate tag name");
            return None;
        }
        let features = query.conditions.features();
        let mut tag = Tag {
            details: TagDetails {
                matches: StreamSet::new(),
                uncertain: all_streams.clone(),
                conditions: query.conditions.clone(),
            },
            definition: record.definition.clone(),
            features,
            color: record.color.clone(),
            converters: Vec::new(),
            filters: Vec::new(),
        };
        if is_mark_name(&record.name) {
            let Some(ids) = query.conditions.stream_ids(next_stream_id) else {
                warn!(state = %source.display(), tag = %record.name, "mark tag is not an id set");
                return None;
            };
            tag.details.matches = ids;
            tag.details.uncertain = StreamSet::new();
        }
        for converter in &record.converters {
            attachments.push((record.name.clone(), converter.clone()));
        }
        tags.insert(record.name.clone(), tag);
    }

    // Reference validation and iterative peel-off cycle detection.
    for (name, tag) in &tags {
        for referenced in tag.features.referenced_tags() {
            if referenced == name {
                warn!(state = %source.display(), tag = %name, "tag references itself");
                return None;
            }
            if !tags.contains_key(referenced) {
                warn!(state = %source.display(), tag = %name, referenced, "unknown referenced tag");
                return None;
            }
        }
    }
    let mut unresolved: HashSet<&str> = tags.keys().map(String::as_str).collect();
    loop {
        let next = unresolved.iter().copied().find(|name| {
            tags[*name]
                .features
                .referenced_tags()
                .all(|rt| !unresolved.contains(rt))
        });
        match next {
            Some(name) => {
                unresolved.remove(name);
            }
            None => break,
        }
    }
    if !unresolved.is_empty() {
        warn!(state = %source.display(), tags = ?unresolved, "tag dependency cycle");
        return None;
    }

    Some((tags, attachments))
}

/// Maps referenced-tag snapshots for a tagging run.
pub(crate) fn referenced_tag_details(
    tags: &std::collections::BTreeMap<String, Tag>,
    tag: &Tag,
) -> HashMap<String, TagDetails> {
    tag.features
        .referenced_tags()
        .filter_map(|name| {
            tags.get(name)
                .map(|t| (name.to_string(), t.details.clone()))
        })
        .collect()
}

