/// Running `Authentication-Results` trailer for a transaction.
///
/// Stages merge their diagnostic fragments (e.g. `spf=pass
/// smtp.mailfrom=alice@example.com`) as they complete; the host renders the
/// header once the pipeline is done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthResultsTrailer {
    fragments: Vec<String>,
}

impl AuthResultsTrailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment, blank fragments are ignored.
    pub fn merge(&mut self, fragment: Option<&str>) {
        if let Some(fragment) = fragment.map(str::trim).filter(|f| !f.is_empty()) {
            self.fragments.push(fragment.trim_end_matches(';').to_string());
        }
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    /// Renders the header value for `authserv_id`.
    pub fn render(&self, authserv_id: &str) -> String {
        if self.fragments.is_empty() {
            return format!("{authserv_id}; none");
        }
        let mut value = String::from(authserv_id);
        for fragment in &self.fragments {
            value.push_str(";\r\n\t");
            value.push_str(fragment);
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_empty() {
        assert_eq!(AuthResultsTrailer::new().render("mx.local"), "mx.local; none");
    }

    #[test]
    fn test_merge_and_render() {
        let mut trailer = AuthResultsTrailer::new();
        trailer.merge(Some("spf=pass smtp.mailfrom=alice@example.com;"));
        trailer.merge(None);
        trailer.merge(Some("   "));
        trailer.merge(Some("dkim=pass header.d=example.com"));

        assert_eq!(trailer.fragments().len(), 2);
        assert_eq!(
            trailer.render("mx.local"),
            "mx.local;\r\n\tspf=pass smtp.mailfrom=alice@example.com;\r\n\tdkim=pass header.d=example.com"
        );
    }
}
