//! Request envelopes for the Virtuozzo agent protocol.
//!
//! Every request is a namespaced `<packet>` document addressed to a target
//! interface. Envelopes are assembled as strings with escaped values; the
//! element vocabulary is fixed, so no general-purpose writer is needed.

pub const API_VERSION: &str = "7.0.0";

const SYSTEM_REALM: &str = "00000000-0000-0000-0000-000000000000";

const PACKET_ATTRS: &str = concat!(
    "xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" ",
    "xmlns:ns2=\"http://www.swsoft.com/webservices/vzl/4.0.0/types\" ",
    "xmlns:ns3=\"http://www.swsoft.com/webservices/vzp/4.0.0/vzptypes\" ",
    "xmlns:ns4=\"http://www.swsoft.com/webservices/vza/4.0.0/vzatypes\"",
);

/// Builder for agent command packets, bound to one target interface.
#[derive(Debug, Clone)]
pub struct XmlCommand {
    interface: String,
}

impl Default for XmlCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlCommand {
    pub fn new() -> Self {
        Self::with_interface("vzpenvm")
    }

    /// Bind the builder to another interface (virtualization type).
    pub fn with_interface(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn packet(&self, target: Option<&str>, data_body: &str) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        xml.push_str(&format!("<packet {PACKET_ATTRS} version=\"{API_VERSION}\">"));
        if let Some(target) = target {
            xml.push_str(&format!("<target>{target}</target>"));
        }
        xml.push_str("<data>");
        xml.push_str(data_body);
        xml.push_str("</data></packet>");
        xml
    }

    fn command(&self, name: &str, inner: &str) -> String {
        let interface = &self.interface;
        self.packet(
            Some(interface),
            &format!("<{interface}><{name}>{inner}</{name}></{interface}>"),
        )
    }

    /// Login envelope. Credentials arrive already base64-encoded.
    pub fn login(&self, username_b64: &str, password_b64: &str) -> String {
        let inner = format!(
            "<system><login xsi:type=\"ns2:auth_nameType\">\
             <name>{}</name><realm>{SYSTEM_REALM}</realm><password>{}</password>\
             </login></system>",
            esc(username_b64),
            esc(password_b64),
        );
        self.packet(None, &inner)
    }

    pub fn create_server(
        &self,
        label: &str,
        home_path: &str,
        image: &str,
        platform: &str,
        memory_mb: u32,
        cpu_count: u32,
        disk_mb: u32,
    ) -> String {
        let config = format!(
            "<config><name>{}</name>{}<memory_size>{memory_mb}</memory_size>\
             <device_list>{}{}</device_list>\
             <cpu_count>{cpu_count}</cpu_count><home_path>{}</home_path></config>",
            esc(label),
            os_element(image, platform),
            hard_disk_device(disk_mb),
            network_device("0.0.0.0"),
            esc(home_path),
        );
        self.command("create", &config)
    }

    pub fn install_tools(&self, server_id: &str) -> String {
        self.command("install_tools", &format!("<eid>{}</eid>", esc(server_id)))
    }

    pub fn server_info(&self, server_id: &str) -> String {
        self.command(
            "get_info",
            &format!("<eid>{}</eid><config/>", esc(server_id)),
        )
    }

    pub fn set_root_password(&self, server_id: &str, password_b64: &str) -> String {
        self.command(
            "set_user_password",
            &format!(
                "<eid>{}</eid><user>root</user><password>{}</password>",
                esc(server_id),
                esc(password_b64),
            ),
        )
    }

    pub fn set_server_config(
        &self,
        server_id: &str,
        memory_mb: u32,
        cpu_count: u32,
        disk_mb: u32,
    ) -> String {
        let mut disk = hard_disk_device(disk_mb);
        disk = disk.replace(
            "</device>",
            "<recreate/><is_boot_in_use/><resize_fs/></device>",
        );

        self.command(
            "set",
            &format!(
                "<eid>{}</eid><config><memory_size>{memory_mb}</memory_size>\
                 <cpu_count>{cpu_count}</cpu_count>\
                 <device_list>{disk}{}</device_list></config>",
                esc(server_id),
                network_device("0.0.0.0"),
            ),
        )
    }

    pub fn set_server_image(&self, server_id: &str, image: &str, platform: &str) -> String {
        self.command(
            "set",
            &format!(
                "<eid>{}</eid><config>{}</config>",
                esc(server_id),
                os_element(image, platform),
            ),
        )
    }

    pub fn restart_server(&self, server_id: &str) -> String {
        self.command("restart", &format!("<eid>{}</eid>", esc(server_id)))
    }

    pub fn stop_server(&self, server_id: &str) -> String {
        self.command("stop", &format!("<eid>{}</eid><force/>", esc(server_id)))
    }

    pub fn start_server(&self, server_id: &str) -> String {
        self.command("start", &format!("<eid>{}</eid>", esc(server_id)))
    }

    pub fn destroy_server(&self, server_id: &str) -> String {
        self.command("destroy", &format!("<eid>{}</eid>", esc(server_id)))
    }
}

fn os_element(image: &str, platform: &str) -> String {
    format!(
        "<os xsi:type=\"ns2:osType\"><name>{}</name><platform>{}</platform></os>",
        esc(image),
        esc(platform),
    )
}

fn hard_disk_device(size_mb: u32) -> String {
    format!(
        "<device xsi:type=\"ns3:vm_hard_disk_device\">\
         <boot_sequence_index>0</boot_sequence_index><is_bootable/>\
         <enabled>1</enabled><connected>1</connected>\
         <emulation_type>1</emulation_type><disk_type>1</disk_type>\
         <size>{size_mb}</size></device>"
    )
}

fn network_device(ip: &str) -> String {
    format!(
        "<device xsi:type=\"ns3:vm_network_device\">\
         <enabled>1</enabled><connected>1</connected>\
         <emulation_type>1</emulation_type><default_gateway/>\
         <virtual_network_id/><ip_address><ip>{}</ip></ip_address></device>",
        esc(ip)
    )
}

fn esc(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_server_packet_carries_target_and_config() {
        let xml = XmlCommand::new().create_server(
            "web1",
            "/vz/private",
            "Ubuntu Linux",
            "Linux",
            1024,
            2,
            10240,
        );

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<target>vzpenvm</target>"));
        assert!(xml.contains("<memory_size>1024</memory_size>"));
        assert!(xml.contains("<cpu_count>2</cpu_count>"));
        assert!(xml.contains("<size>10240</size>"));
        assert!(xml.contains("<name>Ubuntu Linux</name>"));

        // well-formed enough for a namespace-aware parser
        roxmltree::Document::parse(&xml).expect("packet should parse");
    }

    #[test]
    fn login_packet_has_no_target() {
        let xml = XmlCommand::new().login("dXNlcg==", "cGFzcw==");

        assert!(!xml.contains("<target>"));
        assert!(xml.contains("<realm>00000000-0000-0000-0000-000000000000</realm>"));
        assert!(xml.contains("<name>dXNlcg==</name>"));
    }

    #[test]
    fn values_are_escaped() {
        let xml = XmlCommand::new().set_root_password("e<i>d", "p&ss");
        assert!(xml.contains("<eid>e&lt;i&gt;d</eid>"));
        assert!(xml.contains("<password>p&amp;ss</password>"));
    }
}
