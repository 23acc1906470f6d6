//! Archetype path handling.

use std::fmt;

/// One `/`-separated step of an archetype path: `items[at0001, 'Rate']`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSegment {
    pub name: String,
    pub predicate: Option<String>,
}

impl PathSegment {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        match text.find('[') {
            Some(open) if text.ends_with(']') => Self {
                name: text[..open].trim().to_string(),
                predicate: Some(text[open + 1..text.len() - 1].trim().to_string()),
            },
            _ => Self {
                name: text.to_string(),
                predicate: None,
            },
        }
    }

    /// Numeric predicate such as `events[0]`.
    pub fn index(&self) -> Option<usize> {
        self.predicate.as_deref().and_then(|p| p.parse().ok())
    }

    /// Node identifier (`at0001`, an archetype id, ...) of the predicate,
    /// without any node name or numeric index.
    pub fn node_id(&self) -> Option<&str> {
        if self.index().is_some() {
            return None;
        }
        let (first, _) = split_predicate(self.predicate.as_deref()?);
        (!is_name_condition(first)).then_some(first)
    }

    /// Node name the predicate filters on: `events[at0006, 'Any event']`,
    /// `items[at0001, name/value='Rate']` or `items[name/value='Rate']`.
    pub fn name_filter(&self) -> Option<String> {
        if self.index().is_some() {
            return None;
        }
        let (first, rest) = split_predicate(self.predicate.as_deref()?);
        if is_name_condition(first) {
            return Some(name_value(first));
        }
        rest.map(name_value)
    }

    /// The segment with any node name dropped from its predicate.
    pub fn without_name(&self) -> Self {
        Self {
            name: self.name.clone(),
            predicate: match self.index() {
                Some(_) => self.predicate.clone(),
                None => self.node_id().map(str::to_string),
            },
        }
    }
}

/// Split at the first comma outside quotes.
fn split_predicate(predicate: &str) -> (&str, Option<&str>) {
    let mut quote: Option<char> = None;
    for (i, ch) in predicate.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(ch),
            (None, ',') => return (predicate[..i].trim(), Some(predicate[i + 1..].trim())),
            _ => {}
        }
    }
    (predicate.trim(), None)
}

fn is_name_condition(part: &str) -> bool {
    part.starts_with("name/value") || part.starts_with('\'') || part.starts_with('"')
}

fn name_value(part: &str) -> String {
    let value = part
        .strip_prefix("name/value")
        .map(|rest| rest.trim_start().trim_start_matches('=').trim())
        .unwrap_or(part);
    let unquoted = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')));
    match unquoted {
        Some(text) => text.replace("''", "'"),
        None => value.to_string(),
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.predicate {
            Some(p) => write!(f, "{}[{}]", self.name, p),
            None => f.write_str(&self.name),
        }
    }
}

/// A parsed archetype path.
///
/// Display renders the absolute form (`/content[...]/data`); [`relative`]
/// renders the form used after an identifier (`data/events`).
///
/// [`relative`]: AqlPath::relative
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AqlPath {
    segments: Vec<PathSegment>,
}

impl AqlPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Split on `/` outside predicates and string literals.
    pub fn parse(path: &str) -> Self {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut depth = 0usize;
        let mut quote: Option<char> = None;

        for ch in path.chars() {
            if let Some(q) = quote {
                if ch == q {
                    quote = None;
                }
                current.push(ch);
                continue;
            }
            match ch {
                '\'' | '"' if depth > 0 => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '[' => {
                    depth += 1;
                    current.push(ch);
                }
                ']' => {
                    depth = depth.saturating_sub(1);
                    current.push(ch);
                }
                '/' if depth == 0 => {
                    if !current.trim().is_empty() {
                        segments.push(PathSegment::parse(&current));
                    }
                    current.clear();
                }
                _ => current.push(ch),
            }
        }
        if !current.trim().is_empty() {
            segments.push(PathSegment::parse(&current));
        }

        Self { segments }
    }

    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn last(&self) -> Option<&PathSegment> {
        self.segments.last()
    }

    pub fn starts_with(&self, prefix: &AqlPath) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    pub fn strip_prefix(&self, prefix: &AqlPath) -> Option<AqlPath> {
        self.starts_with(prefix).then(|| Self {
            segments: self.segments[prefix.segments.len()..].to_vec(),
        })
    }

    pub fn join(&self, other: &AqlPath) -> AqlPath {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    pub fn parent(&self) -> Option<AqlPath> {
        (!self.segments.is_empty()).then(|| Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn split_at(&self, mid: usize) -> (AqlPath, AqlPath) {
        let mid = mid.min(self.segments.len());
        (
            Self::from_segments(self.segments[..mid].to_vec()),
            Self::from_segments(self.segments[mid..].to_vec()),
        )
    }

    /// Attribute names joined with `/`, predicates dropped.
    pub fn names(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// True when the attribute names (ignoring predicates) start with `names`.
    pub fn names_start_with(&self, names: &str) -> bool {
        let wanted: Vec<&str> = names.split('/').filter(|s| !s.is_empty()).collect();
        self.segments.len() >= wanted.len()
            && self
                .segments
                .iter()
                .zip(&wanted)
                .all(|(segment, name)| segment.name == *name)
    }

    pub fn relative(&self) -> String {
        self.segments
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for AqlPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_respects_predicates() {
        let path = AqlPath::parse("/content[openEHR-EHR-OBSERVATION.bp.v1]/data[at0001]/items[name/value='a/b']");
        assert_eq!(path.len(), 3);
        assert_eq!(path.segments()[0].name, "content");
        assert_eq!(
            path.segments()[0].predicate.as_deref(),
            Some("openEHR-EHR-OBSERVATION.bp.v1")
        );
        assert_eq!(path.segments()[2].predicate.as_deref(), Some("name/value='a/b'"));
    }

    #[test]
    fn test_relative_and_absolute_rendering() {
        let path = AqlPath::parse("data[at0001]/events[0]/time/value");
        assert_eq!(path.relative(), "data[at0001]/events[0]/time/value");
        assert_eq!(path.to_string(), "/data[at0001]/events[0]/time/value");
        assert_eq!(path.names(), "data/events/time/value");
        assert_eq!(path.segments()[1].index(), Some(0));
    }

    #[test]
    fn test_node_name_predicates() {
        let path = AqlPath::parse("data[at0001]/events[at0006, 'Any event']/items[name/value='Rate, at rest']");
        let events = &path.segments()[1];
        assert_eq!(events.node_id(), Some("at0006"));
        assert_eq!(events.name_filter().as_deref(), Some("Any event"));
        assert_eq!(events.without_name().to_string(), "events[at0006]");

        let items = &path.segments()[2];
        assert_eq!(items.node_id(), None);
        assert_eq!(items.name_filter().as_deref(), Some("Rate, at rest"));

        let data = &path.segments()[0];
        assert_eq!(data.node_id(), Some("at0001"));
        assert_eq!(data.name_filter(), None);

        let indexed = PathSegment::parse("events[0]");
        assert_eq!(indexed.node_id(), None);
        assert_eq!(indexed.without_name(), indexed);

        let named = PathSegment::parse("items[at0004, name/value = \"Systolic\"]");
        assert_eq!(named.name_filter().as_deref(), Some("Systolic"));
    }

    #[test]
    fn test_prefix_operations() {
        let base = AqlPath::parse("/context/other_context[at0001]");
        let full = AqlPath::parse("/context/other_context[at0001]/items[at0002]/value");
        assert!(full.starts_with(&base));
        assert_eq!(full.strip_prefix(&base).unwrap().relative(), "items[at0002]/value");
        assert!(full.names_start_with("context/other_context"));
        assert!(!full.names_start_with("context/start_time"));
        assert_eq!(full.parent().unwrap().len(), 3);
    }
}
