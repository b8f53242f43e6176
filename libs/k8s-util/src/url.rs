// Path templating for request metrics, following the grouping rules of
// client-go's rest/request.go so endpoint labels stay low-cardinality.
pub fn template_path(path: &str, base_path: Option<&str>) -> String {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut trimmed_base_path = String::new();

    if let Some(base) = base_path {
        if path.starts_with(base) {
            let p = path.trim_start_matches(base);
            trimmed_base_path = base.to_string();
            segments = p.split('/').filter(|s| !s.is_empty()).collect();
        }
    };

    if segments.len() <= 2 {
        // not enough segments to carry a name, return as is
        return path.to_owned();
    };

    const CORE_GROUP_PREFIX: &str = "api";
    const NAMED_GROUP_PREFIX: &str = "apis";
    let index = match segments[0] {
        CORE_GROUP_PREFIX => 2,
        NAMED_GROUP_PREFIX => 3,
        _ => return "/{prefix}".to_owned(),
    };

    match segments.len() - index {
        // bare resource collection, nothing to template
        1 => {}
        2 => {
            // /$RESOURCE/$NAME
            segments[index + 1] = "{name}";
        }
        3 => {
            if segments[index + 2] == "finalize" || segments[index + 2] == "status" {
                // /$RESOURCE/$NAME/$SUBRESOURCE
                segments[index + 1] = "{name}";
            } else {
                // /namespaces/$NAMESPACE/$RESOURCE
                segments[index + 1] = "{namespace}";
            }
        }
        _ => {
            segments[index + 1] = "{namespace}";
            // /namespaces/$NAMESPACE/$RESOURCE/$NAME(/$SUBRESOURCE)
            if segments[index + 3] != "finalize" && segments[index + 3] != "status" {
                segments[index + 3] = "{name}";
            }
        }
    }

    format!(
        "{}/{}",
        trimmed_base_path.trim_end_matches('/'),
        segments.join("/")
    )
}
