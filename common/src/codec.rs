use std::{ffi::OsString, path::Path};
use tokio::process::Command;

/// Herramienta externa de compresión vista como dos procesos:
/// - decode: lee el archivo comprimido y escribe bytes crudos por stdout
/// - encode: lee bytes crudos por stdin y escribe el resultado en `target`
///
/// El runner se encarga de stdin/stdout/kill_on_drop; acá sólo se arma
/// el programa y sus argumentos.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    fn decode_command(&self, source: &Path) -> Command;

    fn encode_command(&self, size_hint: u64, target: &Path) -> Command;
}

/// Parámetros del compresor zstd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZstdSettings {
    pub binary: String,
    pub level: u8,
    pub window_log: u8,
    /// 0 = todos los cores
    pub threads: u32,
}

impl Default for ZstdSettings {
    fn default() -> Self {
        Self {
            binary: "zstd".to_string(),
            level: 22,
            window_log: 31,
            threads: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZstdCodec {
    settings: ZstdSettings,
}

impl ZstdCodec {
    pub fn new(settings: ZstdSettings) -> Self {
        Self { settings }
    }

    // las rutas pasan como OsString, sin conversión a UTF-8
    fn decode_args(&self, source: &Path) -> Vec<OsString> {
        vec![
            "-d".into(),
            format!("--long={}", self.settings.window_log).into(),
            source.as_os_str().to_owned(),
            "--stdout".into(),
        ]
    }

    fn encode_args(&self, size_hint: u64, target: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            format!("-T{}", self.settings.threads).into(),
            "-v".into(),
            "--compress".into(),
            "--force".into(),
            format!("--long={}", self.settings.window_log).into(),
            format!("-{}", self.settings.level).into(),
        ];
        // niveles > 19 sólo se aceptan con --ultra
        if self.settings.level > 19 {
            args.push("--ultra".into());
        }
        args.push(format!("--stream-size={}", size_hint).into());
        args.push("-o".into());
        args.push(target.as_os_str().to_owned());
        args
    }
}

impl Codec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn decode_command(&self, source: &Path) -> Command {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(self.decode_args(source));
        cmd
    }

    fn encode_command(&self, size_hint: u64, target: &Path) -> Command {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(self.encode_args(size_hint, target));
        cmd
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Formato de juguete: "RZST" + bytes crudos. Alcanza para ejercitar
    /// el pipeline con `sh` sin depender de zstd.
    pub const DECODE_RZST: &str = r#"[ "$(head -c 4 "$1")" = "RZST" ] || { echo "no es un archivo RZST" >&2; exit 1; }; tail -c +5 "$1""#;
    pub const ENCODE_RZST: &str = r#"{ printf RZST; cat; } > "$2""#;

    /// Codec basado en scripts de shell. Decode recibe `$1 = source`,
    /// encode recibe `$1 = size_hint` y `$2 = target`.
    pub struct ShellCodec {
        pub decode: String,
        pub encode: String,
    }

    impl ShellCodec {
        pub fn rzst() -> Self {
            Self::new(DECODE_RZST, ENCODE_RZST)
        }

        pub fn new(decode: &str, encode: &str) -> Self {
            Self {
                decode: decode.to_string(),
                encode: encode.to_string(),
            }
        }
    }

    impl Codec for ShellCodec {
        fn name(&self) -> &str {
            "sh"
        }

        fn decode_command(&self, source: &Path) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.decode).arg("sh").arg(source);
            cmd
        }

        fn encode_command(&self, size_hint: u64, target: &Path) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(&self.encode)
                .arg("sh")
                .arg(size_hint.to_string())
                .arg(target);
            cmd
        }
    }

    /// Arma un archivo RZST con el contenido dado.
    pub fn rzst_bytes(payload: &[u8]) -> Vec<u8> {
        let mut out = b"RZST".to_vec();
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn argumentos_de_decode() {
        let codec = ZstdCodec::new(ZstdSettings::default());
        let args = codec.decode_args(Path::new("/t/ori.zst"));
        assert_eq!(args, vec!["-d", "--long=31", "/t/ori.zst", "--stdout"]);
    }

    #[test]
    fn argumentos_de_encode_con_ultra() {
        let codec = ZstdCodec::new(ZstdSettings::default());
        let args = codec.encode_args(524_288_000, &PathBuf::from("/t/tmp"));
        assert_eq!(
            args,
            vec![
                "-T0",
                "-v",
                "--compress",
                "--force",
                "--long=31",
                "-22",
                "--ultra",
                "--stream-size=524288000",
                "-o",
                "/t/tmp",
            ]
        );
    }

    #[test]
    fn sin_ultra_en_niveles_normales() {
        let codec = ZstdCodec::new(ZstdSettings {
            level: 19,
            threads: 4,
            ..ZstdSettings::default()
        });
        let args = codec.encode_args(0, Path::new("out"));
        assert!(args.iter().any(|a| a == "-19"));
        assert!(args.iter().any(|a| a == "-T4"));
        assert!(!args.iter().any(|a| a == "--ultra"));
        assert!(args.iter().any(|a| a == "--stream-size=0"));
    }

    #[cfg(unix)]
    #[test]
    fn rutas_no_utf8_pasan_intactas() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let codec = ZstdCodec::new(ZstdSettings::default());
        let raw = OsStr::from_bytes(b"/datos/\xfftarea/ori.zst");
        let decode = codec.decode_args(Path::new(raw));
        assert_eq!(decode[2].as_bytes(), raw.as_bytes());

        let encode = codec.encode_args(1, Path::new(raw));
        assert_eq!(encode.last().unwrap().as_bytes(), raw.as_bytes());
    }
}
