use std::path::Path;
use std::process::ExitCode;

use keel_core::{
    Chart, ReleaseContext, order, render_release, resolve_for_chart, teardown_order, to_manifest,
};

use super::{ValuesArgs, load_overrides};

/// Order of the printed resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestOrder {
    Declared,
    Apply,
    Teardown,
}

pub fn render(
    chart_dir: &Path,
    values: &ValuesArgs,
    release: Option<&str>,
    namespace: &str,
    manifest_order: ManifestOrder,
) -> anyhow::Result<ExitCode> {
    let chart = Chart::from_dir(chart_dir)?;
    let resolved = resolve_for_chart(&chart, &load_overrides(values)?)?;
    let context = ReleaseContext::new(release.unwrap_or(chart.name()), namespace);

    let rendered = render_release(&chart, &resolved, &context)?;
    // Ordering runs either way so a cycle fails `render` the same as `apply`.
    let ordered = order(&rendered)?;
    let manifest = match manifest_order {
        ManifestOrder::Declared => to_manifest(&rendered)?,
        ManifestOrder::Apply => to_manifest(&ordered)?,
        ManifestOrder::Teardown => to_manifest(&teardown_order(&rendered)?)?,
    };
    print!("{manifest}");
    Ok(ExitCode::SUCCESS)
}
