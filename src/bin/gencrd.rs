use kube::CustomResourceExt;
use operator::crd::KubeVirt;

use clap::Parser;
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    // Output directory
    #[arg(short, long, default_value = ".")]
    output: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    std::fs::create_dir_all(&args.output)?;
    std::fs::write(
        format!("{}/kubevirt.yaml", args.output),
        serde_yaml::to_string(&KubeVirt::crd())?,
    )?;
    Ok(())
}
