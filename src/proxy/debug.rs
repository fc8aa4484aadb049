//! Rendering for the /debug/configs page.

use super::server::ServerStats;
use super::SiteRule;

/// Renders an HTML summary of the routing table and aggregate counters.
pub async fn render_configs_page(rules: &[SiteRule], stats: &ServerStats) -> String {
    let mut page = String::from(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>locus</title>\n\
         <style>\n\
         body { font-family: monospace; margin: 2em; }\n\
         table { border-collapse: collapse; margin-bottom: 1.5em; }\n\
         td, th { border: 1px solid #999; padding: 4px 8px; text-align: left; }\n\
         </style>\n</head>\n<body>\n<h1>locus</h1>\n",
    );

    page.push_str("<h2>Stats</h2>\n<table>\n");
    row(&mut page, "requests", &stats.requests().to_string());
    row(&mut page, "errors", &stats.errors().to_string());
    row(&mut page, "open connections", &stats.open_connections().to_string());
    page.push_str("</table>\n");

    page.push_str("<h2>Sites</h2>\n");
    for rule in rules {
        page.push_str(&format!("<h3>{}</h3>\n<table>\n", escape(&rule.name)));
        row(&mut page, "bind", &rule.matcher.to_string());
        if let Some(redirect) = rule.redirect {
            row(&mut page, "redirect", &redirect.as_u16().to_string());
        }
        match rule.director.upstreams().await {
            Ok(upstreams) => {
                let list = upstreams
                    .iter()
                    .map(|u| escape(&u.to_string()))
                    .collect::<Vec<_>>()
                    .join("<br>");
                page.push_str(&format!("<tr><td>upstreams</td><td>{list}</td></tr>\n"));
            }
            Err(err) => row(&mut page, "upstream error", &err.to_string()),
        }
        for (key, value) in rule.director.provider_debug_info() {
            row(&mut page, &key, &value);
        }
        page.push_str("</table>\n");
    }

    page.push_str("</body>\n</html>\n");
    page
}

fn row(page: &mut String, key: &str, value: &str) {
    page.push_str(&format!(
        "<tr><td>{}</td><td>{}</td></tr>\n",
        escape(key),
        escape(value)
    ));
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::director::Director;
    use crate::matcher::Matcher;
    use crate::upstream;
    use http::StatusCode;
    use std::sync::Arc;

    #[tokio::test]
    async fn page_lists_rules_and_upstreams() {
        let rules = vec![SiteRule {
            name: "search".to_string(),
            matcher: Matcher::new("www.mysite.com", "/search"),
            director: Director::new(Arc::new(upstream::single("http://search-1.mysite.com")))
                .path_prefix("/search"),
            redirect: Some(StatusCode::MOVED_PERMANENTLY),
        }];
        let stats = ServerStats::default();

        let page = render_configs_page(&rules, &stats).await;
        assert!(page.contains("search"));
        assert!(page.contains("www.mysite.com/search"));
        assert!(page.contains("http://search-1.mysite.com"));
        assert!(page.contains("301"));
    }
}
