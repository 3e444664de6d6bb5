//! Identifier extraction from WFS GetFeature responses
//!
//! A GML2 feature collection looks like:
//!
//! ```xml
//! <wfs:FeatureCollection xmlns:wfs="..." xmlns:gml="http://www.opengis.net/gml" xmlns:ahgf="...">
//!   <gml:featureMember>
//!     <ahgf:AHGFCatchment fid="AHGFCatchment.488811">
//!       <ahgf:hydroid>7155143</ahgf:hydroid>
//!     </ahgf:AHGFCatchment>
//!   </gml:featureMember>
//! </wfs:FeatureCollection>
//! ```
//!
//! Element names are matched on their resolved namespace URL, so the document
//! may bind the layer namespace to any prefix.

use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;

use crate::error::{JoinError, Result};

const GML_NAMESPACE: &[u8] = b"http://www.opengis.net/gml";
const FEATURE_MEMBER: &[u8] = b"featureMember";
const FEATURE_COLLECTION: &[u8] = b"FeatureCollection";

/// Which elements of a feature collection carry the reference identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSelector {
    namespace: String,
    layer: String,
    identifier: String,
}

impl FeatureSelector {
    /// `layer` and `layer_id` may be qualified with `ns_short`
    /// (`ahgf_shcatch:hydroid`) or bare (`hydroid`); both resolve to `ns_url`.
    pub fn new(ns_short: &str, ns_url: &str, layer: &str, layer_id: &str) -> Self {
        let local = |name: &str| -> String {
            name.strip_prefix(ns_short)
                .and_then(|rest| rest.strip_prefix(':'))
                .unwrap_or(name)
                .to_string()
        };

        Self {
            namespace: ns_url.to_string(),
            layer: local(layer),
            identifier: local(layer_id),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    fn matches(&self, resolved: &ResolveResult, local: &[u8], name: &str) -> bool {
        local == name.as_bytes() && in_namespace(resolved, self.namespace.as_bytes())
    }
}

fn in_namespace(resolved: &ResolveResult, namespace: &[u8]) -> bool {
    matches!(resolved, ResolveResult::Bound(Namespace(ns)) if *ns == namespace)
}

/// Return the identifier of the first feature in document order.
///
/// `Ok(None)` when the collection holds no features. Malformed XML, a root
/// other than a feature collection (for example a `ServiceExceptionReport`),
/// or features lacking the configured layer or identifier element are
/// reported as [`JoinError::ResponseParse`].
pub fn extract_feature_identifier(selector: &FeatureSelector, document: &str) -> Result<Option<String>> {
    let mut reader = NsReader::from_str(document);
    reader.config_mut().trim_text(true);

    let mut depth = 0usize;
    let mut root_seen = false;
    let mut member_depth: Option<usize> = None;
    let mut feature_depth: Option<usize> = None;
    let mut identifier_depth: Option<usize> = None;
    let mut members = 0usize;
    let mut features = 0usize;
    let mut text = String::new();

    loop {
        let (resolved, event) = reader
            .read_resolved_event()
            .map_err(|e| JoinError::response_parse(format!("malformed XML: {e}")))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let element_depth = depth + 1;
                let local = e.local_name();
                let local = local.as_ref();

                if !root_seen {
                    root_seen = true;
                    if local != FEATURE_COLLECTION {
                        return Err(JoinError::response_parse(format!(
                            "unexpected root element '{}'",
                            String::from_utf8_lossy(e.name().as_ref())
                        )));
                    }
                } else if member_depth.is_none() {
                    if local == FEATURE_MEMBER && in_namespace(&resolved, GML_NAMESPACE) {
                        members += 1;
                        member_depth = Some(element_depth);
                    }
                } else if feature_depth.is_none() {
                    if member_depth == Some(depth) && selector.matches(&resolved, local, &selector.layer) {
                        features += 1;
                        feature_depth = Some(element_depth);
                    }
                } else if identifier_depth.is_none()
                    && feature_depth == Some(depth)
                    && selector.matches(&resolved, local, &selector.identifier)
                {
                    identifier_depth = Some(element_depth);
                    text.clear();
                }

                if is_empty {
                    // An empty element opens and closes at the same depth
                    if identifier_depth == Some(element_depth) {
                        identifier_depth = None;
                    } else if feature_depth == Some(element_depth) {
                        feature_depth = None;
                    } else if member_depth == Some(element_depth) {
                        member_depth = None;
                    }
                } else {
                    depth = element_depth;
                }
            },
            Event::Text(t) if identifier_depth.is_some() => {
                let value = t
                    .unescape()
                    .map_err(|e| JoinError::response_parse(format!("invalid text: {e}")))?;
                text.push_str(&value);
            },
            Event::CData(c) if identifier_depth.is_some() => {
                text.push_str(&String::from_utf8_lossy(&c));
            },
            Event::End(_) => {
                if identifier_depth == Some(depth) {
                    let value = text.trim();
                    if !value.is_empty() {
                        return Ok(Some(value.to_string()));
                    }
                    identifier_depth = None;
                } else if feature_depth == Some(depth) {
                    feature_depth = None;
                } else if member_depth == Some(depth) {
                    member_depth = None;
                }
                depth = depth.saturating_sub(1);
            },
            Event::Eof => break,
            _ => {},
        }
    }

    if !root_seen {
        return Err(JoinError::response_parse("empty response document"));
    }
    if members == 0 {
        return Ok(None);
    }
    if features == 0 {
        return Err(JoinError::response_parse(format!(
            "no '{}' feature in namespace '{}'",
            selector.layer, selector.namespace
        )));
    }
    Err(JoinError::response_parse(format!(
        "feature '{}' has no '{}' value",
        selector.layer, selector.identifier
    )))
}
