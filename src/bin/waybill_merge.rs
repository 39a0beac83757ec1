//! CLI tool for merging waybill pages into tracking-number order

use std::env;
use std::fs;
use std::process;
use std::time::Instant;
use waybill_matcher::{
    CancelToken, MatchConfig, PdftoppmRasterizer, ProgressEvent, SourceInput, TesseractCli,
    WaybillMerger,
};

struct Args {
    targets_path: String,
    output_path: String,
    inputs: Vec<String>,
    unmatched_path: Option<String>,
    config: MatchConfig,
    raster: PdftoppmRasterizer,
    ocr: TesseractCli,
}

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} <targets.txt> <output.pdf> <input.pdf>... [options]",
        program
    );
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --crop-top N       top band height for OCR, percent (5-60, default 25)");
    eprintln!("  --batch-size N     identifiers per progress update (5-100, default 25)");
    eprintln!("  --unmatched FILE   write unmatched identifiers as CSV");
    eprintln!("  --tesseract PATH   tesseract binary (default: tesseract)");
    eprintln!("  --lang LANG        tesseract language (default: eng)");
    eprintln!("  --pdftoppm PATH    pdftoppm binary for page rendering (default: pdftoppm)");
    eprintln!();
    eprintln!("Exit status: 0 all matched, 2 some unmatched, 1 error.");
    process::exit(1);
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut positional = Vec::new();
    let mut unmatched_path = None;
    let mut config = MatchConfig::default();
    let mut ocr = TesseractCli::new();
    let mut raster = PdftoppmRasterizer::new();

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{flag} needs a value"))
        };
        match arg.as_str() {
            "--crop-top" => {
                let v = value("--crop-top")?;
                config.crop_top_percent = v
                    .parse()
                    .map_err(|_| format!("--crop-top: not a number: {v}"))?;
            }
            "--batch-size" => {
                let v = value("--batch-size")?;
                config.batch_size = v
                    .parse()
                    .map_err(|_| format!("--batch-size: not a number: {v}"))?;
            }
            "--unmatched" => unmatched_path = Some(value("--unmatched")?),
            "--tesseract" => ocr = ocr.with_binary(value("--tesseract")?),
            "--lang" => ocr = ocr.with_language(value("--lang")?),
            "--pdftoppm" => raster = raster.with_binary(value("--pdftoppm")?),
            flag if flag.starts_with("--") => return Err(format!("unknown option {flag}")),
            _ => positional.push(arg.clone()),
        }
    }

    if positional.len() < 3 {
        return Err("need a targets file, an output file and at least one input".to_string());
    }
    let inputs = positional.split_off(2);
    let output_path = positional.pop().unwrap_or_default();
    let targets_path = positional.pop().unwrap_or_default();

    Ok(Args {
        targets_path,
        output_path,
        inputs,
        unmatched_path,
        config,
        raster,
        ocr,
    })
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::FileStarted {
            index,
            name,
            page_count,
            kind,
        } => println!("[{}] {} ({} pages, {:?})", index + 1, name, page_count, kind),
        ProgressEvent::FileFailed {
            index,
            name,
            reason,
        } => eprintln!("[{}] {} skipped: {}", index + 1, name, reason),
        ProgressEvent::PageResolved {
            location,
            method,
            identifiers,
        } if !identifiers.is_empty() => {
            println!("  {}: {} ({})", location, identifiers.join(", "), method)
        }
        ProgressEvent::AssemblyProgress { processed, total } => {
            println!("Assembling {}/{}", processed, total)
        }
        _ => {}
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("waybill-merge");

    let parsed = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {}", e);
            usage(program);
        }
    };

    let targets_text = match fs::read_to_string(&parsed.targets_path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error reading {}: {}", parsed.targets_path, e);
            process::exit(1);
        }
    };
    let identifiers: Vec<&str> = targets_text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let mut inputs = Vec::with_capacity(parsed.inputs.len());
    for path in &parsed.inputs {
        match fs::read(path) {
            Ok(bytes) => inputs.push(SourceInput::new(path.clone(), bytes)),
            Err(e) => {
                eprintln!("Error reading {}: {}", path, e);
                process::exit(1);
            }
        }
    }

    let start = Instant::now();
    let merger = WaybillMerger::with_backends(parsed.config, parsed.raster, parsed.ocr);
    let outcome = match merger.run(
        &identifiers,
        inputs,
        &mut print_event,
        &CancelToken::new(),
    ) {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let report = &outcome.report;
    println!();
    println!("Waybill Merge Results");
    println!("=====================");
    println!("Files processed: {}", report.processed_files);
    println!("Files skipped: {}", report.failed_files.len());
    println!("Matched: {}/{}", report.matched_count, report.total_targets);
    for (method, count) in &report.method_counts {
        println!("  {}: {} pages", method, count);
    }
    for anomaly in &report.anomalies {
        println!(
            "Warning: {} carries {}",
            anomaly.location,
            anomaly.identifiers.join(", ")
        );
    }
    println!("Time: {}ms", start.elapsed().as_millis());

    match &outcome.merged {
        Some(pdf) => {
            if let Err(e) = fs::write(&parsed.output_path, pdf) {
                eprintln!("Error writing {}: {}", parsed.output_path, e);
                process::exit(1);
            }
            println!("Wrote {} pages to {}", outcome.page_count, parsed.output_path);
        }
        None => println!("No identifier matched, {} not written", parsed.output_path),
    }

    if let Some(path) = &parsed.unmatched_path {
        let written = report
            .unmatched_csv()
            .map_err(|e| e.to_string())
            .and_then(|csv| fs::write(path, csv).map_err(|e| e.to_string()));
        if let Err(e) = written {
            eprintln!("Error writing {}: {}", path, e);
            process::exit(1);
        }
    }

    if !report.unmatched.is_empty() {
        println!();
        println!("Unmatched ({}):", report.unmatched.len());
        for identifier in &report.unmatched {
            println!("  {}", identifier);
        }
        process::exit(2);
    }
}
