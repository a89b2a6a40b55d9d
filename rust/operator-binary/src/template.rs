//! The template surface exposed to WorkspaceKind authors. Values in
//! `extraEnv` and `httpProxy.requestHeaders` may substitute exactly one
//! callable, `httpPathPrefix(portId="...")`; everything else is rejected at
//! admission so a bad kind can never take the reconciler down at runtime.

use std::collections::HashMap;

use snafu::{ResultExt, Snafu};
use tera::{Tera, Value};

pub const HTTP_PATH_PREFIX_FUNCTION: &str = "httpPathPrefix";

const INLINE_TEMPLATE_NAME: &str = "inline";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to parse template {template:?}"))]
    Parse {
        source: tera::Error,
        template: String,
    },

    #[snafu(display("failed to render template {template:?}"))]
    Render {
        source: tera::Error,
        template: String,
    },

    #[snafu(display(
        "template {template:?} uses block or comment syntax, only value substitution is available"
    ))]
    UnsupportedBlock { template: String },
}

/// The values `httpPathPrefix` resolves against: the workspace identity and
/// the port ids declared by its resolved image option.
#[derive(Clone, Debug)]
pub struct PathPrefixContext {
    pub namespace: String,
    pub workspace_name: String,
    pub port_ids: Vec<String>,
}

impl PathPrefixContext {
    /// The external path prefix for a declared port id, or the empty string
    /// for an unknown one.
    pub fn http_path_prefix(&self, port_id: &str) -> String {
        if self.port_ids.iter().any(|id| id == port_id) {
            format!(
                "/workspace/{namespace}/{name}/{port_id}/",
                namespace = self.namespace,
                name = self.workspace_name,
            )
        } else {
            String::new()
        }
    }
}

pub fn render(template: &str, ctx: &PathPrefixContext) -> Result<String, Error> {
    // Tera would happily accept loops and conditionals, which are not part
    // of the supported surface.
    if template.contains("{%") || template.contains("{#") {
        return UnsupportedBlockSnafu { template }.fail();
    }

    let mut tera = Tera::default();
    let ctx = ctx.clone();
    tera.register_function(
        HTTP_PATH_PREFIX_FUNCTION,
        move |args: &HashMap<String, Value>| {
            let port_id = args
                .get("portId")
                .and_then(Value::as_str)
                .ok_or_else(|| tera::Error::msg("httpPathPrefix requires a portId argument"))?;
            Ok(Value::String(ctx.http_path_prefix(port_id)))
        },
    );

    tera.add_raw_template(INLINE_TEMPLATE_NAME, template)
        .context(ParseSnafu { template })?;
    tera.render(INLINE_TEMPLATE_NAME, &tera::Context::new())
        .context(RenderSnafu { template })
}

/// Admission-time check: templates must parse and render against a
/// representative context. Unknown functions and variables surface here
/// instead of during reconciliation.
pub fn validate(template: &str, ctx: &PathPrefixContext) -> Result<(), Error> {
    render(template, ctx).map(drop)
}
