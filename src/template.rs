//! Page templates loaded from a directory tree.
//!
//! ```text
//! templates/
//! ├── includes/    partials available to every page   ({{> header}})
//! ├── layouts/     page skeletons, also partials      ({{> base}})
//! └── users/
//!     └── list.html   page "list"
//! ```
//!
//! Includes and layouts are parsed once into a base registry. Each page gets
//! its own copy of that base, so a page can fill in a layout with inline
//! partials without leaking them into other pages:
//!
//! ```handlebars
//! {{#*inline "content"}}<ul>{{#each users}}<li>{{name}}</li>{{/each}}</ul>{{/inline}}
//! {{> base}}
//! ```
//!
//! Names are file stems. The first partial loaded under a name keeps it, and
//! includes load before layouts. A file elsewhere in the tree whose name
//! matches an include or layout is skipped, which is how `includes/` and
//! `layouts/` themselves are passed over on the page walk.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use handlebars::{Handlebars, HelperDef, RenderError, TemplateError, handlebars_helper};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};
use walkdir::WalkDir;

use crate::context::{Context, Key};
use crate::handler::BoxedHandler;
use crate::logging;
use crate::writer::ResponseWriter;

const EXTENSION: &str = "html";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to walk template directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("failed to read template {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse template {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<TemplateError>,
    },

    #[error("page template {name:?} is defined by both {} and {}", first.display(), second.display())]
    DuplicatePage {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("unknown page template {0:?}")]
    UnknownPage(String),

    #[error(transparent)]
    Render(#[from] RenderError),
}

handlebars_helper!(has_field: |value: Json, name: str| {
    value.as_object().is_some_and(|fields| fields.contains_key(name))
});

// ── Builder ───────────────────────────────────────────────────────────────────

type BoxedHelper = Box<dyn HelperDef + Send + Sync + 'static>;

/// Configures helpers before any template is parsed.
#[derive(Default)]
pub struct Builder {
    helpers: Vec<(String, BoxedHelper)>,
    strict: bool,
}

impl Builder {
    /// Registers a helper for every template. A helper named like a built-in
    /// (including `hasField`) replaces it.
    pub fn helper<H>(mut self, name: impl Into<String>, helper: H) -> Self
    where
        H: HelperDef + Send + Sync + 'static,
    {
        self.helpers.push((name.into(), Box::new(helper)));
        self
    }

    /// Makes references to missing fields a render error instead of empty
    /// output.
    pub fn strict_mode(mut self, enabled: bool) -> Self {
        self.strict = enabled;
        self
    }

    pub fn load(self, root: impl AsRef<Path>) -> Result<TemplateSet, Error> {
        let root = root.as_ref();

        let mut base = Handlebars::new();
        base.set_strict_mode(self.strict);
        base.register_helper("hasField", Box::new(has_field));
        for (name, helper) in self.helpers {
            base.register_helper(&name, helper);
        }

        let mut shared = HashSet::new();
        for dir in ["includes", "layouts"] {
            let dir = root.join(dir);
            if !dir.is_dir() {
                continue;
            }
            for (name, path) in html_files(&dir)? {
                if shared.contains(&name) {
                    debug!(template = %name, path = %path.display(), "partial already loaded, skipping");
                    continue;
                }
                debug!(template = %name, path = %path.display(), "loading partial");
                let source = read(&path)?;
                base.register_partial(&name, source)
                    .map_err(|e| Error::Parse { path: path.clone(), source: Box::new(e) })?;
                shared.insert(name);
            }
        }

        let mut pages: HashMap<String, (PathBuf, Handlebars<'static>)> = HashMap::new();
        for (name, path) in html_files(root)? {
            if shared.contains(&name) {
                continue;
            }
            if let Some((first, _)) = pages.get(&name) {
                return Err(Error::DuplicatePage { name, first: first.clone(), second: path });
            }

            debug!(template = %name, path = %path.display(), "loading page");
            let source = read(&path)?;
            let mut page = base.clone();
            page.register_template_string(&name, source)
                .map_err(|e| Error::Parse { path: path.clone(), source: Box::new(e) })?;
            pages.insert(name, (path, page));
        }

        Ok(TemplateSet {
            pages: pages.into_iter().map(|(name, (_, page))| (name, page)).collect(),
        })
    }
}

/// `(stem, path)` for every `.html` file under `dir`, in file-name order.
fn html_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, Error> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            files.push((stem.to_owned(), path.to_path_buf()));
        }
    }
    Ok(files)
}

fn read(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|source| Error::Io { path: path.to_path_buf(), source })
}

// ── TemplateSet ───────────────────────────────────────────────────────────────

/// Parsed page templates, keyed by name. Built once at startup and shared
/// read-only.
pub struct TemplateSet {
    pages: HashMap<String, Handlebars<'static>>,
}

impl TemplateSet {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Loads `root` with only the built-in helpers.
    pub fn load(root: impl AsRef<Path>) -> Result<Self, Error> {
        Builder::default().load(root)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pages.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pages.keys().map(String::as_str)
    }

    /// Renders page `name` with `data` into `writer`.
    pub fn render<T, W>(&self, name: &str, writer: W, data: &T) -> Result<(), Error>
    where
        T: Serialize,
        W: io::Write,
    {
        let page = self.pages.get(name).ok_or_else(|| Error::UnknownPage(name.to_owned()))?;
        page.render_to_write(name, data, writer)?;
        Ok(())
    }
}

impl std::fmt::Debug for TemplateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("TemplateSet").field("pages", &names).finish()
    }
}

// ── Request context ───────────────────────────────────────────────────────────

pub static TEMPLATES: Key<Arc<TemplateSet>> = Key::new("templates");

/// Attaches `set` to every request under [`TEMPLATES`].
pub fn middleware(set: Arc<TemplateSet>) -> impl Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static {
    crate::middleware::attach(TEMPLATES, set)
}

/// # Panics
///
/// Panics if [`middleware`] was not installed.
pub fn extract(ctx: &Context) -> &TemplateSet {
    match ctx.value(TEMPLATES) {
        Some(set) => set,
        None => panic!("no template set in context"),
    }
}

/// Renders page `name` into `w`, logging failures instead of returning them.
///
/// A render error can leave a partial body behind, since output goes
/// straight to the writer.
///
/// # Panics
///
/// Panics if the request logger or the template [`middleware`] is missing.
pub fn render<T: Serialize>(ctx: &Context, w: &ResponseWriter, name: &str, data: &T) {
    let span = logging::extract(ctx).span();
    debug!(parent: span, template = name, "rendering template");

    if let Err(e) = extract(ctx).render(name, w.clone(), data) {
        error!(parent: span, template = name, error = %e, "failed to render template");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, contents) in files {
            let path = dir.path().join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        dir
    }

    fn render_str(set: &TemplateSet, name: &str, data: &serde_json::Value) -> String {
        let mut out = Vec::new();
        set.render(name, &mut out, data).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn pages_fill_layouts_and_use_includes() {
        let dir = tree(&[
            ("includes/header.html", "<h1>{{title}}</h1>"),
            ("layouts/base.html", "<html>{{> header}}{{> content}}</html>"),
            (
                "users/list.html",
                r#"{{#*inline "content"}}{{#each users}}<li>{{this}}</li>{{/each}}{{/inline}}{{> base}}"#,
            ),
        ]);
        let set = TemplateSet::load(dir.path()).unwrap();

        assert!(set.contains("list"));
        assert!(!set.contains("header"));
        assert!(!set.contains("base"));
        assert_eq!(
            render_str(&set, "list", &json!({"title": "Users", "users": ["ada", "bob"]})),
            "<html><h1>Users</h1><li>ada</li><li>bob</li></html>",
        );
    }

    #[test]
    fn include_and_layout_directories_are_optional() {
        let dir = tree(&[("index.html", "hi {{name}}"), ("notes.txt", "ignored")]);
        let set = TemplateSet::load(dir.path()).unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), ["index"]);
        assert_eq!(render_str(&set, "index", &json!({"name": "ada"})), "hi ada");
    }

    #[test]
    fn pages_named_like_partials_are_skipped() {
        let dir = tree(&[
            ("includes/footer.html", "shared footer"),
            ("pages/footer.html", "page footer"),
            ("pages/home.html", "{{> footer}}"),
        ]);
        let set = TemplateSet::load(dir.path()).unwrap();
        assert!(!set.contains("footer"));
        assert_eq!(render_str(&set, "home", &json!({})), "shared footer");
    }

    #[test]
    fn includes_win_over_layouts_of_the_same_name() {
        let dir = tree(&[
            ("includes/frame.html", "include frame"),
            ("layouts/frame.html", "layout frame"),
            ("home.html", "{{> frame}}"),
        ]);
        let set = TemplateSet::load(dir.path()).unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), ["home"]);
        assert_eq!(render_str(&set, "home", &json!({})), "include frame");
    }

    #[test]
    fn duplicate_page_names_fail_to_load() {
        let dir = tree(&[("a/show.html", "a"), ("b/show.html", "b")]);
        let err = TemplateSet::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::DuplicatePage { ref name, .. } if name == "show"));
    }

    #[test]
    fn syntax_errors_name_the_file() {
        let dir = tree(&[("broken.html", "{{#if}}")]);
        match TemplateSet::load(dir.path()).unwrap_err() {
            Error::Parse { path, .. } => assert!(path.ends_with("broken.html")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_page() {
        let dir = tree(&[("index.html", "")]);
        let set = TemplateSet::load(dir.path()).unwrap();
        let err = set.render("missing", Vec::new(), &json!({})).unwrap_err();
        assert!(matches!(err, Error::UnknownPage(ref name) if name == "missing"));
        assert_eq!(err.to_string(), r#"unknown page template "missing""#);
    }

    #[test]
    fn output_is_html_escaped() {
        let dir = tree(&[("index.html", "{{text}}")]);
        let set = TemplateSet::load(dir.path()).unwrap();
        assert_eq!(render_str(&set, "index", &json!({"text": "<b>&"})), "&lt;b&gt;&amp;");
    }

    #[test]
    fn has_field() {
        let dir = tree(&[(
            "index.html",
            r#"{{#if (hasField user "email")}}yes{{else}}no{{/if}} {{hasField name "len"}}"#,
        )]);
        let set = TemplateSet::load(dir.path()).unwrap();
        assert_eq!(
            render_str(&set, "index", &json!({"user": {"email": null}, "name": "ada"})),
            "yes false",
        );
        assert_eq!(render_str(&set, "index", &json!({"user": {}, "name": "ada"})), "no false");
    }

    #[test]
    fn custom_helpers_are_available_to_partials() {
        handlebars_helper!(shout: |s: str| s.to_uppercase());

        let dir = tree(&[("includes/greeting.html", "{{shout name}}!"), ("index.html", "{{> greeting}}")]);
        let set = TemplateSet::builder().helper("shout", shout).load(dir.path()).unwrap();
        assert_eq!(render_str(&set, "index", &json!({"name": "ada"})), "ADA!");
    }

    #[test]
    fn strict_mode_rejects_missing_fields() {
        let dir = tree(&[("index.html", "{{missing}}")]);
        let set = TemplateSet::builder().strict_mode(true).load(dir.path()).unwrap();
        assert!(matches!(set.render("index", Vec::new(), &json!({})), Err(Error::Render(_))));
    }

    #[test]
    #[should_panic(expected = "no template set in context")]
    fn extract_without_middleware_panics() {
        extract(&Context::new());
    }

    #[tokio::test]
    #[should_panic(expected = "no logger in context")]
    async fn render_without_a_logger_panics() {
        let dir = tree(&[("home.html", "hi")]);
        let set = Arc::new(TemplateSet::load(dir.path()).unwrap());
        let ctx = Context::new().with_value(TEMPLATES, set);
        let (sink, _head) = crate::writer::Sink::channel();
        render(&ctx, &ResponseWriter::new(sink), "home", &json!({}));
    }
}
