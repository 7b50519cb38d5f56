use anyhow::Result;
use bitflip::{Codec, DecoderParser, FileSource, Harness};
use std::env;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <input.bz2> [bit offset]", args[0]);
        return Ok(());
    }

    let source = FileSource::new(&args[1]);
    let offset = args.get(2).map(|s| s.parse::<u64>()).transpose()?;

    let harness = Harness::new(DecoderParser::new(Codec::Bzip2));
    let attempt = harness.attempt(&source, offset)?;
    println!("{}", attempt);

    Ok(())
}
