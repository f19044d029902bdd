//! Interactive shell (§6): a stateful REPL session owning a single
//! `Parser`. Commands: `disk <path>`, `mount <index>`, `unmount [<index>]`,
//! `show`, `quit`, `help`.

use std::io::{self, Write};

use console::style;
use imagemounter::Parser;

pub async fn run(parser: &mut Parser) -> io::Result<()> {
    println!("{}", style("interactive shell — type `help` for commands").cyan());
    let stdin = io::stdin();

    loop {
        print!("imount> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            println!();
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else { continue };
        let rest: Vec<&str> = parts.collect();

        match cmd {
            "quit" | "exit" => break,
            "help" => print_help(),
            "show" => show_tree(parser),
            "disk" => {
                let Some(path) = rest.first() else {
                    println!("usage: disk <path>");
                    continue;
                };
                if let Err(e) = add_and_mount_disk(parser, path).await {
                    println!("{} {e}", style("error:").red());
                }
            }
            "mount" => {
                let Some(index) = rest.first() else {
                    println!("usage: mount <index>");
                    continue;
                };
                match parser.init_volumes(Some(index), None, true).await {
                    Ok(()) => println!("mount pass complete for {index}"),
                    Err(e) => println!("{} {e}", style("error:").red()),
                }
            }
            "unmount" => {
                if let Some(index) = rest.first() {
                    match parser.unmount_by_index(index, false).await {
                        Ok(true) => println!("unmounted {index}"),
                        Ok(false) => println!("no such volume: {index}"),
                        Err(e) => println!("{} {e}", style("error:").red()),
                    }
                } else {
                    match parser.clean(true, false).await {
                        Ok(()) => println!("unmounted everything"),
                        Err(e) => println!("{} {e}", style("error:").red()),
                    }
                }
            }
            other => println!("unknown command `{other}`; try `help`"),
        }
    }

    Ok(())
}

async fn add_and_mount_disk(parser: &mut Parser, path: &str) -> imagemounter::Result<()> {
    let config = parser.config.clone();
    let disk = parser.add_disk(std::path::Path::new(path), None)?;
    disk.mount(&config).await?;
    disk.detect_volumes(&config, false).await?;
    println!("disk backing mounted; {} top-level volumes detected", disk.volumes.len());
    Ok(())
}

fn print_help() {
    println!("commands:");
    println!("  disk <path>       mount a new disk's backing and detect its volumes");
    println!("  mount <index>     mount the volume at <index>");
    println!("  unmount [<index>] unmount one volume, or everything if no index given");
    println!("  show              print the disk/volume tree");
    println!("  quit              leave the shell (volumes stay mounted)");
    println!("  help              show this message");
}

fn show_tree(parser: &Parser) {
    for (i, disk) in parser.disks.iter().enumerate() {
        let label = disk.index.clone().unwrap_or_else(|| i.to_string());
        println!(
            "disk {label}: {} [{:?}]",
            disk.paths[0].display(),
            disk.backing_category
        );
        for volume in &disk.volumes {
            print_volume(volume, 1);
        }
    }
}

fn print_volume(volume: &imagemounter::volume::Volume, depth: usize) {
    let indent = "  ".repeat(depth);
    let fs = volume
        .fs_type
        .map(|f| f.as_str())
        .unwrap_or("(undetected)");
    let mountpoint = volume
        .mountpoint
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{indent}{} [{:?}] {fs} -> {mountpoint}",
        volume.index, volume.flag
    );
    for child in &volume.volumes {
        print_volume(child, depth + 1);
    }
}
