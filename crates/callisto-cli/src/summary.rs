use callisto_core::sequence::Sequence;
use callisto_core::source::SourceKind;
use console::Style;

struct Styles {
    title: Style,
    label: Style,
    value: Style,
    kind: Style,
}

impl Styles {
    fn new() -> Self {
        Self {
            title: Style::new().cyan().bold(),
            label: Style::new().dim(),
            value: Style::new().bold().white(),
            kind: Style::new().green(),
        }
    }
}

pub fn print_sequence_summary(seq: &Sequence) {
    let s = Styles::new();
    let (width, height) = seq.dimensions();
    let kind = match seq.source_kind() {
        Some(SourceKind::Regular) => "image files",
        Some(SourceKind::Container) => "SER container",
        Some(SourceKind::Film) => "film container",
        Some(SourceKind::Memory) => "in-memory",
        None => "unloaded",
    };

    println!();
    println!("  {}", s.title.apply_to(&seq.name));
    println!(
        "  {:<12}{}",
        s.label.apply_to("Store"),
        s.kind.apply_to(kind)
    );
    println!(
        "  {:<12}{}",
        s.label.apply_to("Frames"),
        s.value
            .apply_to(format!("{} ({} selected)", seq.frame_count(), seq.selected_count()))
    );
    println!(
        "  {:<12}{}",
        s.label.apply_to("Size"),
        s.value.apply_to(format!(
            "{}x{}, {} layer(s), {}-bit",
            width,
            height,
            seq.layer_count(),
            seq.bit_depth()
        ))
    );
    if seq.cfa_opened_mono {
        println!(
            "  {:<12}{}",
            s.label.apply_to("CFA"),
            s.kind.apply_to("raw mosaic (demosaic off)")
        );
    }
    if seq.upscale != 1.0 {
        println!(
            "  {:<12}{}",
            s.label.apply_to("Upscale"),
            s.value.apply_to(format!("{}x", seq.upscale))
        );
    }
    if let Some(path) = seq.seqfile_path() {
        println!(
            "  {:<12}{}",
            s.label.apply_to("Index"),
            s.value.apply_to(path.display())
        );
    }
}
