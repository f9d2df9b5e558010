//! The machine-description generator.
//!
//! Writes the libvirt-style `physical.xml` document the remote virt-v2v
//! consumes through `-i libvirtxml`.  Each physical disk appears as an
//! NBD-backed network disk pointing at the remote end of that disk's
//! reverse port forward; the conversion supervisor treats the whole file
//! as opaque.

use std::io::Cursor;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context as _};
use color_eyre::Result;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::writer::Writer;

use crate::config::Config;
use crate::conversion::{DataConn, DescriptionGenerator};

/// Generates the libvirt-style physical machine description.
#[derive(Debug, Default)]
pub struct LibvirtDescription;

struct Xml {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl Xml {
    fn new() -> Xml {
        Xml {
            writer: Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2),
        }
    }

    fn start(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(name);
        for (key, value) in attributes {
            elem.push_attribute((*key, *value));
        }
        self.writer
            .write_event(Event::Start(elem))
            .map_err(|e| eyre!("Failed to write start element: {}", e))?;
        Ok(())
    }

    fn end(&mut self, name: &str) -> Result<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(|e| eyre!("Failed to write end element: {}", e))?;
        Ok(())
    }

    fn empty(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(name);
        for (key, value) in attributes {
            elem.push_attribute((*key, *value));
        }
        self.writer
            .write_event(Event::Empty(elem))
            .map_err(|e| eyre!("Failed to write empty element: {}", e))?;
        Ok(())
    }

    fn text_element(&mut self, name: &str, attributes: &[(&str, &str)], text: &str) -> Result<()> {
        self.start(name, attributes)?;
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(|e| eyre!("Failed to write text: {}", e))?;
        self.end(name)
    }

    fn into_string(self) -> Result<String> {
        let bytes = self.writer.into_inner().into_inner();
        String::from_utf8(bytes).map_err(|e| eyre!("Failed to convert XML to string: {}", e))
    }
}

/// Resolve the network an interface is mapped to.  Entries in the
/// network map are either `interface:network` pairs or a bare network
/// name which becomes the default for unmapped interfaces.
fn network_for_interface<'a>(network_map: &'a [String], interface: &str) -> &'a str {
    let mut default = "default";
    for entry in network_map {
        match entry.split_once(':') {
            Some((iface, network)) if iface == interface => return network,
            Some(_) => {}
            None => default = entry,
        }
    }
    default
}

/// Name of the Nth guest disk: sda, sdb, ..., sdz, sdaa, ...
fn drive_name(mut index: usize) -> String {
    let mut name = String::new();
    loop {
        name.insert(0, (b'a' + (index % 26) as u8) as char);
        index /= 26;
        if index == 0 {
            break;
        }
        index -= 1;
    }
    format!("sd{name}")
}

fn describe(config: &Config, conns: &[DataConn]) -> Result<String> {
    let mut xml = Xml::new();
    let memory = config.memory.to_string();
    let vcpus = config.vcpus.to_string();

    xml.start("domain", &[("type", "physical")])?;
    xml.text_element("name", &[], &config.guestname)?;
    xml.text_element("memory", &[("unit", "b")], &memory)?;
    xml.text_element("currentMemory", &[("unit", "b")], &memory)?;
    xml.text_element("vcpu", &[], &vcpus)?;
    xml.start("os", &[])?;
    xml.text_element("type", &[], "hvm")?;
    xml.empty("boot", &[("dev", "hd")])?;
    xml.end("os")?;
    xml.start("features", &[])?;
    xml.empty("acpi", &[])?;
    xml.empty("apic", &[])?;
    xml.empty("pae", &[])?;
    xml.end("features")?;

    xml.start("devices", &[])?;
    // Fixed disks, served from the local NBD servers through the reverse
    // port forwards.  From the remote side each disk is an NBD service on
    // localhost at the forwarded port.
    for (i, conn) in conns.iter().enumerate() {
        let port = conn.remote_port().to_string();
        xml.start("disk", &[("type", "network"), ("device", "disk")])?;
        xml.empty("driver", &[("name", "qemu"), ("type", "raw")])?;
        xml.start("source", &[("protocol", "nbd")])?;
        xml.empty("host", &[("name", "localhost"), ("port", &port)])?;
        xml.end("source")?;
        xml.empty("target", &[("dev", &drive_name(i)), ("bus", "virtio")])?;
        xml.end("disk")?;
    }
    // Removable devices are described but carry no medium.
    for (i, _) in config.removable.iter().enumerate() {
        let dev = drive_name(conns.len() + i);
        xml.start("disk", &[("type", "network"), ("device", "cdrom")])?;
        xml.empty("driver", &[("name", "qemu"), ("type", "raw")])?;
        xml.empty("target", &[("dev", &dev), ("bus", "ide")])?;
        xml.end("disk")?;
    }
    for interface in &config.interfaces {
        let network = network_for_interface(&config.network_map, interface);
        xml.start("interface", &[("type", "network")])?;
        xml.empty("source", &[("network", network)])?;
        xml.text_element("note", &[], interface)?;
        xml.empty("model", &[("type", "virtio")])?;
        xml.end("interface")?;
    }
    xml.end("devices")?;
    xml.end("domain")?;

    xml.into_string()
}

impl DescriptionGenerator for LibvirtDescription {
    fn generate(&self, config: &Config, conns: &[DataConn], path: &Utf8Path) -> Result<()> {
        let xml = describe(config, conns)?;
        std::fs::write(path, format!("{xml}\n")).with_context(|| format!("write {path}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_names() {
        assert_eq!(drive_name(0), "sda");
        assert_eq!(drive_name(1), "sdb");
        assert_eq!(drive_name(25), "sdz");
        assert_eq!(drive_name(26), "sdaa");
        assert_eq!(drive_name(27), "sdab");
    }

    #[test]
    fn test_network_mapping() {
        let map = vec![
            "eth0:mgmt".to_string(),
            "eth1:data".to_string(),
            "internal".to_string(),
        ];
        assert_eq!(network_for_interface(&map, "eth0"), "mgmt");
        assert_eq!(network_for_interface(&map, "eth1"), "data");
        assert_eq!(network_for_interface(&map, "eth2"), "internal");
        assert_eq!(network_for_interface(&[], "eth0"), "default");
    }

    #[test]
    fn test_describe_names_guest_and_resources() {
        let mut config = Config::new();
        config.guestname = "phys".to_string();
        config.vcpus = 4;
        config.memory = 2 * 1024 * 1024 * 1024;
        config.interfaces = vec!["eth0".to_string()];
        let xml = describe(&config, &[]).unwrap();
        assert!(xml.contains("<name>phys</name>"));
        assert!(xml.contains("<vcpu>4</vcpu>"));
        assert!(xml.contains("<memory unit=\"b\">2147483648</memory>"));
        assert!(xml.contains("<interface type=\"network\">"));
    }
}
